use pagestream_core::{FetchError, PageDecoder, PageNumber, RenderImage};

/// Decodes PNG, JPEG, GIF and WebP payloads to RGBA8.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageDecoder;

impl PageDecoder for ImageDecoder {
    fn decode(&self, page: PageNumber, payload: &[u8]) -> Result<RenderImage, FetchError> {
        let decoded = image::load_from_memory(payload).map_err(|err| FetchError::Decode {
            page,
            message: err.to_string(),
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            return Err(FetchError::Decode {
                page,
                message: "image has no pixels".into(),
            });
        }
        Ok(RenderImage {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }
}
