//! Total viewshed: one visibility computation per observer point, run on an external
//! terrain engine with a bounded number of concurrent jobs, summed up into a raster.

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod launcher;
pub mod points;
pub mod poller;
pub mod run;
