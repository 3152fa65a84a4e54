use axum::Router;

use crate::{billing, customers, subscriptions};

pub fn api_routes() -> Router {
    Router::new()
        .merge(customers::routes())
        .merge(subscriptions::routes())
        .merge(billing::api::routes())
}
