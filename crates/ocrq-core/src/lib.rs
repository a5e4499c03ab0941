//! ocrq-core – the asynchronous OCR task lifecycle.
//!
//! Submission creates a [`Task`] in the [`store`], persists the upload in the
//! [`payload`] store and enqueues a process message on the [`broker`].  A
//! [`worker::Worker`] claims the task, runs the external [`engine`], records
//! the terminal outcome and enqueues a webhook delivery, which a
//! [`webhook::Dispatcher`] sends with retry and backoff.
//!
//! The HTTP surface lives in `ocrq-server`; everything it needs is exposed
//! through [`api::OcrService`].

pub mod api;
pub mod broker;
pub mod engine;
pub mod error;
pub mod payload;
pub mod store;
pub mod types;
pub mod webhook;
pub mod worker;

#[cfg(test)]
mod tests;

pub use error::{CoreError, OcrError};
pub use types::{NewTask, OcrResult, Task, TaskStatus};
