pub mod client;
pub mod types;

pub use client::{ProctorServer, ServerClient};
pub use types::{deserialize_exam_id, AuthSession, ExamDetails, ExamEvent, ExamId, Proctor};
