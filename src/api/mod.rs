//! Local HTTP management surface used by the exam page in the taker's
//! browser: start and stop an exam, inspect the pipeline, preview the camera.

mod preview;
mod routes;

pub use routes::create_router;

use crate::exam::SessionCoordinator;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: SessionCoordinator,
}

impl ApiState {
    pub fn new(coordinator: SessionCoordinator) -> Self {
        Self { coordinator }
    }
}
