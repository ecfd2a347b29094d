// src/lib.rs
//
// sunlink: solar telemetry pipeline for Sungrow hybrid inverters.
//
// Two binaries share this library:
//   - sunlink-edge polls the inverter over Modbus TCP, normalizes raw
//     registers into samples, spools them durably on local disk, and
//     uploads batches to the VPS over HTTPS.
//   - sunlink-ingest receives those batches, stores them idempotently in
//     a TimescaleDB hypertable, and serves realtime/series queries.

#[macro_use]
mod logging;

pub mod config;
pub mod edge;
pub mod health;
pub mod normalizer;
pub mod poller;
pub mod registers;
pub mod sample;
pub mod server;
pub mod spool;
pub mod uploader;

pub use sample::Sample;
