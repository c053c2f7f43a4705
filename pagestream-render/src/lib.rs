//! Network and image adapters for `pagestream-core`.

mod decode;
mod http;

pub use decode::ImageDecoder;
pub use http::HttpTransport;
