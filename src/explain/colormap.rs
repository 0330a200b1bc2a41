use image::Rgb;
use serde::Deserialize;

/// Fixed color scales for rendering a [0, 1] intensity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colormap {
    /// Blue through cyan, yellow and red, as OpenCV's `COLORMAP_JET`
    Jet,
    /// Black through red and yellow to white
    Hot,
}

type Anchors = &'static [(f32, f32)];

const JET_R: Anchors = &[(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const JET_G: Anchors = &[
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const JET_B: Anchors = &[(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

const HOT_R: Anchors = &[(0.0, 0.0416), (0.365079, 1.0), (1.0, 1.0)];
const HOT_G: Anchors = &[(0.0, 0.0), (0.365079, 0.0), (0.746032, 1.0), (1.0, 1.0)];
const HOT_B: Anchors = &[(0.0, 0.0), (0.746032, 0.0), (1.0, 1.0)];

impl Colormap {
    /// Color for `value`. The value is quantized to 8 bits first, the way an
    /// 8-bit lookup table would see it
    pub fn rgb(self, value: f32) -> Rgb<u8> {
        let level = (value.clamp(0.0, 1.0) * 255.0) as u8;
        self.lookup(level)
    }

    pub fn lookup(self, level: u8) -> Rgb<u8> {
        let x = level as f32 / 255.0;
        let (r, g, b) = match self {
            Colormap::Jet => (JET_R, JET_G, JET_B),
            Colormap::Hot => (HOT_R, HOT_G, HOT_B),
        };
        Rgb([channel(r, x), channel(g, x), channel(b, x)])
    }
}

fn channel(anchors: Anchors, x: f32) -> u8 {
    (interpolate(anchors, x) * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Piecewise-linear interpolation between `(position, value)` anchors
fn interpolate(anchors: Anchors, x: f32) -> f32 {
    for pair in anchors.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if x <= x1 {
            let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
            return y0 + t * (y1 - y0);
        }
    }
    anchors.last().map(|&(_, y)| y).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(Colormap::Jet.rgb(0.0), Rgb([0, 0, 128]));
        assert_eq!(Colormap::Jet.rgb(1.0), Rgb([128, 0, 0]));
    }

    #[test]
    fn test_jet_middle_is_green() {
        let Rgb([r, g, b]) = Colormap::Jet.rgb(0.5);
        assert!(g > 250);
        assert!(r < 200 && b < 200);
    }

    #[test]
    fn test_hot_endpoints() {
        assert_eq!(Colormap::Hot.rgb(1.0), Rgb([255, 255, 255]));
        let Rgb([r, g, b]) = Colormap::Hot.rgb(0.0);
        assert_eq!((g, b), (0, 0));
        assert!(r > 0 && r < 20);
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        assert_eq!(Colormap::Jet.rgb(-3.0), Colormap::Jet.rgb(0.0));
        assert_eq!(Colormap::Jet.rgb(7.0), Colormap::Jet.rgb(1.0));
        assert_eq!(Colormap::Jet.rgb(f32::NAN), Colormap::Jet.rgb(0.0));
    }
}
