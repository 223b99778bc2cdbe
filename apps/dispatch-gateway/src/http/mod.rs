pub mod images;
pub mod queue;

use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().merge(queue::router()).merge(images::router())
}
