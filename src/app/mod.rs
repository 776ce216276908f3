pub mod dispatcher;
pub mod error;
pub mod http;
pub mod model;
pub mod queue;
pub mod review;
pub mod runner;
pub mod store;
