use crate::cifar_io::CIFAR_SIDE;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::Rng;

/// Per-channel mean and standard deviation of 0.5; maps [0, 1]
/// pixels onto [-1, 1]
pub const HALF_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const HALF_STD: [f32; 3] = [0.5, 0.5, 0.5];

#[derive(Clone, Debug, PartialEq)]
pub enum TransformStep {
    /// scale so that the shorter side has this length
    ResizeShorter(usize),
    /// scale to exactly (height, width)
    Resize(usize, usize),
    /// crop a random square of this side
    RandomCrop(usize),
    /// mirror left-right with this probability
    RandomHorizontalFlip(f64),
}

impl TransformStep {
    fn apply<R: Rng + ?Sized>(&self, img: RgbImage, rng: &mut R) -> anyhow::Result<RgbImage> {
        let (w, h) = img.dimensions();
        match *self {
            TransformStep::ResizeShorter(side) => {
                let side = side as u32;
                let (nw, nh) = if w <= h {
                    (side, (h as u64 * side as u64 / w as u64) as u32)
                } else {
                    ((w as u64 * side as u64 / h as u64) as u32, side)
                };
                if (nw, nh) == (w, h) {
                    Ok(img)
                } else {
                    Ok(imageops::resize(&img, nw, nh, FilterType::Triangle))
                }
            }
            TransformStep::Resize(nh, nw) => {
                let (nw, nh) = (nw as u32, nh as u32);
                if (nw, nh) == (w, h) {
                    Ok(img)
                } else {
                    Ok(imageops::resize(&img, nw, nh, FilterType::Triangle))
                }
            }
            TransformStep::RandomCrop(side) => {
                let side = side as u32;
                if side > w || side > h {
                    return Err(anyhow::anyhow!(
                        "crop size {} is larger than the {}x{} image",
                        side,
                        w,
                        h
                    ));
                }
                let x0 = rng.random_range(0..=(w - side));
                let y0 = rng.random_range(0..=(h - side));
                Ok(imageops::crop_imm(&img, x0, y0, side, side).to_image())
            }
            TransformStep::RandomHorizontalFlip(p) => {
                if rng.random_bool(p) {
                    Ok(imageops::flip_horizontal(&img))
                } else {
                    Ok(img)
                }
            }
        }
    }
}

/// A chain of image steps followed by conversion to a normalized
/// CHW float vector
#[derive(Clone, Debug)]
pub struct Compose {
    steps: Vec<TransformStep>,
    mean: [f32; 3],
    std: [f32; 3],
}

pub struct TransformedImage {
    pub data: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl Compose {
    pub fn new(steps: Vec<TransformStep>, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { steps, mean, std }
    }

    /// resize -> random crop -> random flip -> normalize
    pub fn train(img_size: usize) -> Self {
        Self::new(
            vec![
                TransformStep::ResizeShorter(img_size),
                TransformStep::RandomCrop(img_size),
                TransformStep::RandomHorizontalFlip(0.5),
            ],
            HALF_MEAN,
            HALF_STD,
        )
    }

    /// resize to (img_size, img_size) -> normalize
    pub fn test(img_size: usize) -> Self {
        Self::new(
            vec![TransformStep::Resize(img_size, img_size)],
            HALF_MEAN,
            HALF_STD,
        )
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    /// Transform a CIFAR record (channel-major 32 x 32 bytes)
    pub fn apply_cifar<R: Rng + ?Sized>(
        &self,
        pixels: &[u8],
        rng: &mut R,
    ) -> anyhow::Result<TransformedImage> {
        self.apply(cifar_to_image(pixels)?, rng)
    }

    pub fn apply<R: Rng + ?Sized>(
        &self,
        img: RgbImage,
        rng: &mut R,
    ) -> anyhow::Result<TransformedImage> {
        let mut img = img;
        for step in self.steps.iter() {
            img = step.apply(img, rng)?;
        }
        Ok(self.to_tensor_data(&img))
    }

    fn to_tensor_data(&self, img: &RgbImage) -> TransformedImage {
        let (w, h) = img.dimensions();
        let (w, h) = (w as usize, h as usize);
        let mut data = vec![0f32; 3 * h * w];
        for (x, y, px) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let v = px[c] as f32 / 255.0;
                data[c * h * w + y * w + x] = (v - self.mean[c]) / self.std[c];
            }
        }
        TransformedImage {
            data,
            height: h,
            width: w,
        }
    }
}

pub fn cifar_to_image(pixels: &[u8]) -> anyhow::Result<RgbImage> {
    let plane = CIFAR_SIDE * CIFAR_SIDE;
    if pixels.len() != 3 * plane {
        return Err(anyhow::anyhow!(
            "expected {} bytes per image, got {}",
            3 * plane,
            pixels.len()
        ));
    }
    let side = CIFAR_SIDE as u32;
    Ok(RgbImage::from_fn(side, side, |x, y| {
        let i = (y * side + x) as usize;
        Rgb([pixels[i], pixels[plane + i], pixels[2 * plane + i]])
    }))
}
