use utoipa::OpenApi;

use crate::routes::{health, ocr};

#[derive(OpenApi)]
#[openapi(info(
    title = "ocrq-server",
    description = "Asynchronous OCR task service: submit a file, poll its status, receive the result by webhook",
    version = "0.1.0"
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(ocr::OcrApi::openapi());
    root
}
