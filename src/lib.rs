pub mod auth;
pub mod batch_writer;
pub mod config;
pub mod customers;
pub mod dataset_cache;
pub mod dataset_engine;
pub mod day_store;
pub mod error;
pub mod followmee;
pub mod geocode;
pub mod handlers;
pub mod house_number;
pub mod models;
pub mod overlay;
pub mod reconciler;
pub mod sheet_store;
pub mod streets;
pub mod tracking;
pub mod users;

use std::sync::Arc;

use batch_writer::BatchWriter;
use customers::CustomerDirectory;
use dataset_engine::DatasetEngine;
use day_store::DayStore;
use geocode::GeocodeQueue;
use tracking::TrackingIngest;
use users::UserDirectory;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DatasetEngine>,
    pub day_store: Arc<DayStore>,
    pub geocode: GeocodeQueue,
    pub writer: Arc<BatchWriter>,
    pub customers: Arc<CustomerDirectory>,
    pub users: Arc<UserDirectory>,
    pub tracking: Arc<TrackingIngest>,
    pub external_push_key: Option<String>,
}
