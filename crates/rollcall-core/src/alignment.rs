//! Face alignment to the canonical ArcFace crop.
//!
//! Fits a 4-DOF similarity (uniform scale, rotation, translation) from the
//! detected five-point landmarks to the InsightFace reference layout, then
//! resamples the face into a 112×112 grayscale crop.

use image::{GrayImage, Luma};

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// `x' = a·x − b·y + tx`, `y' = b·x + a·y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Similarity = Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Closed-form least-squares fit mapping `src` onto `dst`.
    ///
    /// Degenerate input (all source points coincident) yields the identity.
    pub fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut norm = 0.0f32;
        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (px, py) = (sx - smx, sy - smy);
            let (qx, qy) = (dx - dmx, dy - dmy);
            norm += px * px + py * py;
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
        }

        if norm < 1e-9 {
            return Self::IDENTITY;
        }

        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Inverse transform, or `None` when the scale collapsed to zero.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        let inv = Self { a: ia, b: ib, tx: 0.0, ty: 0.0 };
        let (tx, ty) = inv.apply((self.tx, self.ty));
        Some(Self { tx: -tx, ty: -ty, ..inv })
    }
}

/// Bilinear sample; pixels outside the image read as black.
fn sample(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |xi: i64, yi: i64| -> f32 {
        if xi >= 0 && xi < w && yi >= 0 && yi < h {
            image.get_pixel(xi as u32, yi as u32).0[0] as f32
        } else {
            0.0
        }
    };

    let top = px(x0, y0) * (1.0 - fx) + px(x0 + 1, y0) * fx;
    let bottom = px(x0, y0 + 1) * (1.0 - fx) + px(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Warp `image` into a `size`×`size` crop through `transform` (source → crop).
pub fn warp(image: &GrayImage, transform: &Similarity, size: u32) -> GrayImage {
    let Some(inv) = transform.inverse() else {
        return GrayImage::new(size, size);
    };
    GrayImage::from_fn(size, size, |ox, oy| {
        let (sx, sy) = inv.apply((ox as f32, oy as f32));
        Luma([sample(image, sx, sy).round().clamp(0.0, 255.0) as u8])
    })
}

/// Align a detected face to a canonical 112×112 crop.
pub fn align_face(image: &GrayImage, landmarks: &[(f32, f32); 5]) -> GrayImage {
    let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS);
    warp(image, &transform, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS);
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_half_scale() {
        let src = REFERENCE_LANDMARKS.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 - 4.0));
        let t = Similarity::fit(&src, &REFERENCE_LANDMARKS);
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
        let (x, y) = t.apply(src[2]);
        assert!((x - REFERENCE_LANDMARKS[2].0).abs() < 1e-2);
        assert!((y - REFERENCE_LANDMARKS[2].1).abs() < 1e-2);
    }

    #[test]
    fn test_inverse_roundtrips_point() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 5.0, ty: -2.0 };
        let inv = t.inverse().unwrap();
        let (x, y) = inv.apply(t.apply((17.0, 42.0)));
        assert!((x - 17.0).abs() < 1e-3 && (y - 42.0).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_fit_is_identity() {
        let src = [(5.0, 5.0); 5];
        assert_eq!(Similarity::fit(&src, &REFERENCE_LANDMARKS), Similarity::IDENTITY);
    }

    #[test]
    fn test_align_face_output_size() {
        let image = GrayImage::from_pixel(640, 480, Luma([128]));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_bright_patch_lands_on_reference_eye() {
        let mut image = GrayImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for dy in 0..5 {
            for dx in 0..5 {
                image.put_pixel(78 + dx, 58 + dy, Luma([255]));
            }
        }

        let aligned = align_face(&image, &src);
        let (rx, ry) = (
            REFERENCE_LANDMARKS[0].0.round() as u32,
            REFERENCE_LANDMARKS[0].1.round() as u32,
        );
        let brightest = (rx - 1..=rx + 1)
            .flat_map(|x| (ry - 1..=ry + 1).map(move |y| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "max near reference eye = {brightest}");
    }
}
