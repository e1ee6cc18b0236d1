use std::str::FromStr;

use bincode::{Decode, Encode};
use kornia_image::{
    allocator::{CpuAllocator, ImageAllocator},
    Image, ImageSize,
};
use kornia_imgproc::flip::{horizontal_flip, vertical_flip};
use serde::{Deserialize, Serialize};

use crate::error::{BofError, BofResult};
use crate::patch::Pixel;

fn to_owned_image<T, A>(src: &Image<T, 1, A>) -> BofResult<Image<T, 1, CpuAllocator>>
where
    T: Pixel,
    A: ImageAllocator,
{
    Ok(Image::new(src.size(), src.as_slice().to_vec(), CpuAllocator)?)
}

/// Rotate the input image by 90 degrees counter-clockwise.
///
/// The output has the width and height of the input swapped.
///
/// # Example
///
/// ```
/// use kornia_image::{allocator::CpuAllocator, Image, ImageSize};
/// use kornia_bof::augment::rotate90;
///
/// // 1 2
/// // 3 4
/// let size = ImageSize { width: 2, height: 2 };
/// let image = Image::<u8, 1, _>::new(size, vec![1, 2, 3, 4], CpuAllocator).unwrap();
/// let rotated = rotate90(&image).unwrap();
///
/// // 2 4
/// // 1 3
/// assert_eq!(rotated.as_slice(), &[2, 4, 1, 3]);
/// ```
pub fn rotate90<T, A>(src: &Image<T, 1, A>) -> BofResult<Image<T, 1, CpuAllocator>>
where
    T: Pixel,
    A: ImageAllocator,
{
    let (rows, cols) = (src.rows(), src.cols());
    let data = src.as_slice();

    let mut out = Vec::with_capacity(data.len());
    for y in 0..cols {
        for x in 0..rows {
            out.push(data[x * cols + (cols - 1 - y)]);
        }
    }

    let size = ImageSize {
        width: rows,
        height: cols,
    };
    Ok(Image::new(size, out, CpuAllocator)?)
}

/// Mirror applied before the rotation of a [`Transform`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum Flip {
    /// Keep the orientation.
    None,
    /// Mirror columns.
    LeftRight,
    /// Mirror rows.
    UpDown,
}

impl Flip {
    fn apply<T, A>(self, src: &Image<T, 1, A>) -> BofResult<Image<T, 1, CpuAllocator>>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        let mut dst = to_owned_image(src)?;
        match self {
            Flip::None => {}
            Flip::LeftRight => horizontal_flip(src, &mut dst)?,
            Flip::UpDown => vertical_flip(src, &mut dst)?,
        }
        Ok(dst)
    }
}

/// An exact geometric transform: an optional flip followed by
/// `quarter_turns` counter-clockwise rotations of 90 degrees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Transform {
    /// Number of 90 degree counter-clockwise rotations, in `0..4`.
    pub quarter_turns: u8,
    /// Flip applied before rotating.
    pub flip: Flip,
}

impl Transform {
    /// The identity transform.
    pub const IDENTITY: Transform = Transform {
        quarter_turns: 0,
        flip: Flip::None,
    };

    /// Apply the transform to an image.
    pub fn apply<T, A>(&self, src: &Image<T, 1, A>) -> BofResult<Image<T, 1, CpuAllocator>>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        let mut dst = self.flip.apply(src)?;
        for _ in 0..self.quarter_turns % 4 {
            dst = rotate90(&dst)?;
        }
        Ok(dst)
    }

    /// Undo the transform, recovering the image `apply` was called on.
    pub fn invert<T, A>(&self, src: &Image<T, 1, A>) -> BofResult<Image<T, 1, CpuAllocator>>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        let mut dst = to_owned_image(src)?;
        for _ in 0..(4 - self.quarter_turns % 4) % 4 {
            dst = rotate90(&dst)?;
        }
        self.flip.apply(&dst)
    }
}

/// Augmentation policy used to enlarge the training sample and to pool
/// predictions over geometric variants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum Augment {
    /// Only the original image.
    #[default]
    None,
    /// The four 90 degree rotations.
    Rotate,
    /// The original plus its left-right and up-down mirrors.
    Reflect,
    /// Every rotation of every reflection.
    Both,
}

const REFLECTIONS: [Flip; 3] = [Flip::None, Flip::LeftRight, Flip::UpDown];

impl Augment {
    /// The ordered list of transforms generated by the policy.
    ///
    /// `Both` is rotation major, reflection minor.
    pub fn transforms(&self) -> Vec<Transform> {
        match self {
            Augment::None => vec![Transform::IDENTITY],
            Augment::Rotate => (0..4)
                .map(|quarter_turns| Transform {
                    quarter_turns,
                    flip: Flip::None,
                })
                .collect(),
            Augment::Reflect => REFLECTIONS
                .iter()
                .map(|&flip| Transform {
                    quarter_turns: 0,
                    flip,
                })
                .collect(),
            Augment::Both => (0..4)
                .flat_map(|quarter_turns| {
                    REFLECTIONS.iter().map(move |&flip| Transform {
                        quarter_turns,
                        flip,
                    })
                })
                .collect(),
        }
    }

    /// Number of variants generated per image.
    pub fn num_variants(&self) -> usize {
        match self {
            Augment::None => 1,
            Augment::Rotate => 4,
            Augment::Reflect => 3,
            Augment::Both => 12,
        }
    }

    /// Generate every variant of `image`, in the order of [`Augment::transforms`].
    ///
    /// # Example
    ///
    /// ```
    /// use kornia_image::{allocator::CpuAllocator, Image, ImageSize};
    /// use kornia_bof::augment::Augment;
    ///
    /// let size = ImageSize { width: 30, height: 40 };
    /// let image = Image::<f32, 1, _>::from_size_val(size, 0.0, CpuAllocator).unwrap();
    /// let augmented = Augment::Rotate.augment(&image).unwrap();
    ///
    /// assert_eq!(augmented.len(), 4);
    /// assert_eq!(augmented[1].size(), ImageSize { width: 40, height: 30 });
    /// ```
    pub fn augment<T, A>(&self, image: &Image<T, 1, A>) -> BofResult<Vec<Image<T, 1, CpuAllocator>>>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        self.transforms()
            .iter()
            .map(|transform| transform.apply(image))
            .collect()
    }
}

impl FromStr for Augment {
    type Err = BofError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Augment::None),
            "rotate" => Ok(Augment::Rotate),
            "reflect" => Ok(Augment::Reflect),
            "both" => Ok(Augment::Both),
            other => Err(BofError::UnknownAugment(other.to_string())),
        }
    }
}

impl std::fmt::Display for Augment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Augment::None => "none",
            Augment::Rotate => "rotate",
            Augment::Reflect => "reflect",
            Augment::Both => "both",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type GrayImage<T> = Image<T, 1, CpuAllocator>;

    fn random_image(width: usize, height: usize) -> Result<GrayImage<f32>, BofError> {
        let mut rng = StdRng::seed_from_u64(7);
        let data = (0..width * height).map(|_| rng.random::<f32>()).collect();
        Ok(Image::new(ImageSize { width, height }, data, CpuAllocator)?)
    }

    fn same<T: Pixel + PartialEq + std::fmt::Debug>(a: &GrayImage<T>, b: &GrayImage<T>) {
        assert_eq!(a.size(), b.size());
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_flip_variants() -> Result<(), BofError> {
        let image: GrayImage<u8> = Image::new(
            ImageSize {
                width: 2,
                height: 3,
            },
            vec![0u8, 1, 2, 3, 4, 5],
            CpuAllocator,
        )?;
        let left_right = Transform {
            quarter_turns: 0,
            flip: Flip::LeftRight,
        };
        let up_down = Transform {
            quarter_turns: 0,
            flip: Flip::UpDown,
        };
        assert_eq!(left_right.apply(&image)?.as_slice(), &[1u8, 0, 3, 2, 5, 4]);
        assert_eq!(up_down.apply(&image)?.as_slice(), &[4u8, 5, 2, 3, 0, 1]);
        Ok(())
    }

    #[test]
    fn test_rotate90_shape() -> Result<(), BofError> {
        // 0 1 2
        // 3 4 5
        let image: GrayImage<u8> = Image::new(
            ImageSize {
                width: 3,
                height: 2,
            },
            vec![0u8, 1, 2, 3, 4, 5],
            CpuAllocator,
        )?;
        let rotated = rotate90(&image)?;
        assert_eq!(
            rotated.size(),
            ImageSize {
                width: 2,
                height: 3
            }
        );
        // 2 5
        // 1 4
        // 0 3
        assert_eq!(rotated.as_slice(), &[2u8, 5, 1, 4, 0, 3]);
        Ok(())
    }

    #[test]
    fn test_rotate() -> Result<(), BofError> {
        let image = random_image(30, 40)?;
        let augmented = Augment::Rotate.augment(&image)?;
        assert_eq!(augmented.len(), 4);
        assert_eq!(augmented[0].size(), image.size());
        assert_eq!(augmented[2].size(), image.size());
        assert_eq!(augmented[1].size(), ImageSize::from([40, 30]));
        assert_eq!(augmented[3].size(), ImageSize::from([40, 30]));
        // a further quarter turn closes the cycle
        same(&rotate90(&augmented[3])?, &image);
        Ok(())
    }

    #[test]
    fn test_reflect() -> Result<(), BofError> {
        let image = random_image(30, 40)?;
        let augmented = Augment::Reflect.augment(&image)?;
        assert_eq!(augmented.len(), 3);
        for variant in &augmented {
            assert_eq!(variant.size(), image.size());
        }
        same(&augmented[0], &image);

        let mut restored = random_image(30, 40)?;
        horizontal_flip(&augmented[1], &mut restored)?;
        same(&restored, &image);
        vertical_flip(&augmented[2], &mut restored)?;
        same(&restored, &image);
        Ok(())
    }

    #[test]
    fn test_both() -> Result<(), BofError> {
        let image = random_image(30, 40)?;
        let augmented = Augment::Both.augment(&image)?;
        assert_eq!(augmented.len(), 12);
        assert_eq!(Augment::Both.num_variants(), 12);
        Ok(())
    }

    #[test]
    fn test_round_trip() -> Result<(), BofError> {
        let image = random_image(7, 5)?;
        for policy in [Augment::None, Augment::Rotate, Augment::Reflect, Augment::Both] {
            let transforms = policy.transforms();
            assert_eq!(transforms.len(), policy.num_variants());
            for (transform, variant) in transforms.iter().zip(policy.augment(&image)?) {
                same(&transform.invert(&variant)?, &image);
            }
        }
        Ok(())
    }

    #[test]
    fn test_variants_are_permutations() -> Result<(), BofError> {
        let image: GrayImage<u16> = Image::new(
            ImageSize {
                width: 4,
                height: 3,
            },
            (0u16..12).collect(),
            CpuAllocator,
        )?;
        for variant in Augment::Both.augment(&image)? {
            let mut values = variant.as_slice().to_vec();
            values.sort_unstable();
            assert_eq!(values, (0u16..12).collect::<Vec<_>>());
        }
        Ok(())
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("rotate".parse::<Augment>().ok(), Some(Augment::Rotate));
        assert_eq!("Both".parse::<Augment>().ok(), Some(Augment::Both));
        assert_eq!("none".parse::<Augment>().ok(), Some(Augment::None));
        assert!(matches!(
            "shear".parse::<Augment>(),
            Err(BofError::UnknownAugment(_))
        ));
        assert_eq!(Augment::Reflect.to_string(), "reflect");
    }
}
