pub mod nvt_config;
pub mod nvt_controllers;
pub mod nvt_error;
pub mod nvt_feed;
pub mod nvt_geometry;
pub mod nvt_gtfs;
pub mod nvt_models;
pub mod nvt_pipeline;
pub mod nvt_single_flight;
pub mod nvt_snapping;
pub mod nvt_static_store;
pub mod nvt_upstream;
pub mod nvt_views;
