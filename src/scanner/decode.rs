use image::DynamicImage;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::PhotoError;

/// Decode an image and rotate/flip it upright according to its EXIF
/// orientation, so detection boxes are in display coordinates.
pub fn load_oriented(path: &Path) -> Result<DynamicImage, PhotoError> {
    if !path.exists() {
        return Err(PhotoError::Missing(path.to_path_buf()));
    }

    let img = image::open(path).map_err(|e| PhotoError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok(apply_orientation(img, read_orientation(path)))
}

/// EXIF orientation tag (1-8); 1 when absent or unreadable.
pub fn read_orientation(path: &Path) -> u16 {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return 1,
    };

    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(e) => e,
        Err(_) => return 1,
    };

    if let Some(field) = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) {
        if let exif::Value::Short(ref v) = field.value {
            if let Some(&orientation) = v.first() {
                return orientation;
            }
        }
    }

    1
}

pub fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use tempfile::tempdir;

    /// 2x1 image: red on the left, blue on the right.
    fn strip() -> DynamicImage {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 255]));
        DynamicImage::ImageRgb8(img)
    }

    fn red_at(img: &DynamicImage) -> (u32, u32) {
        img.pixels()
            .find(|(_, _, p)| p.0[0] == 255)
            .map(|(x, y, _)| (x, y))
            .unwrap()
    }

    #[test]
    fn test_all_orientations() {
        // (orientation, dimensions, position of the red pixel)
        let cases = [
            (1, (2, 1), (0, 0)),
            (2, (2, 1), (1, 0)),
            (3, (2, 1), (1, 0)),
            (4, (2, 1), (0, 0)),
            (5, (1, 2), (0, 0)),
            (6, (1, 2), (0, 0)),
            (7, (1, 2), (0, 1)),
            (8, (1, 2), (0, 1)),
        ];

        for (orientation, dims, red) in cases {
            let out = apply_orientation(strip(), orientation);
            assert_eq!(out.dimensions(), dims, "orientation {}", orientation);
            assert_eq!(red_at(&out), red, "orientation {}", orientation);
        }
    }

    #[test]
    fn test_load_plain_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        strip().save(&path).unwrap();

        assert_eq!(read_orientation(&path), 1);
        assert_eq!(load_oriented(&path).unwrap().dimensions(), (2, 1));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        assert!(matches!(load_oriented(&path), Err(PhotoError::Decode { .. })));
        assert!(matches!(
            load_oriented(&dir.path().join("gone.jpg")),
            Err(PhotoError::Missing(_))
        ));
    }
}
