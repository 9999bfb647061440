use crate::shared::frame::Frame;

/// Nearest-neighbour resize of an RGB crop into a `1×3×size×size` tensor,
/// passing every channel value through `normalize`.
pub(crate) fn to_nchw(
    crop: &Frame,
    size: usize,
    normalize: impl Fn(f32) -> f32,
) -> Result<ndarray::Array4<f32>, Box<dyn std::error::Error>> {
    let src_w = crop.width() as usize;
    let src_h = crop.height() as usize;
    if src_w == 0 || src_h == 0 {
        return Err("Cannot preprocess an empty crop".into());
    }
    if crop.channels() < 3 {
        return Err(format!("Expected an RGB crop, got {} channel(s)", crop.channels()).into());
    }

    let src = crop.as_ndarray();
    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / size as f64) as usize).min(src_h - 1);
        for x in 0..size {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / size as f64) as usize).min(src_w - 1);
            for c in 0..3 {
                tensor[[0, c, y, x]] = normalize(src[[src_y, src_x, c]] as f32);
            }
        }
    }

    Ok(tensor)
}
