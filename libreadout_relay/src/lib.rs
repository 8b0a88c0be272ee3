//! # readout_relay
//!
//! readout_relay is the front-end event relay of a detector readout node, written in
//! Rust. It takes the fragments delivered by the readout board's DMA engine, stitches
//! them back into whole events, checks every event's structure and per-channel CRC,
//! and forwards the accepted events over a pool of persistent TCP links to the
//! downstream event aggregator.
//!
//! ## Installation
//!
//! The only method of install is from source.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### Building & Install
//!
//! To build and install the CLI relay use `cargo install --path ./readout_relay_cli`
//! from the top level readout_relay repository.
//!
//! Two cargo features exist for bench work and are off by default:
//!
//! - `permissive`: DMA and event magic failures are logged as warnings instead of
//! stopping the relay. A permissive build refuses to start unless the configuration
//! sets `permissive_acknowledged: true`.
//! - `skip-crc`: a build with this feature refuses to start at all.
//!
//! ## Pipeline
//!
//! ```text
//! FragmentSource -> Reassembler -> Validator -+-> Dispatcher -> sender workers -> TCP
//!                                             |
//!                                 not reduced +-> reduce_event -> Validator (once)
//! ```
//!
//! Every failure other than a DMA trailer that sits exactly one DMA word early is
//! fatal: it is logged and counted where it is found, and `process` returns it. An event
//! flagged not-reduced by the hardware gets exactly one pass through the reducer; if it
//! still fails validation afterwards, that failure is fatal.
//!
//! Events are handed to the workers round-robin. Each worker owns two slots; when both
//! are full the ingest loop waits for that worker, so a slow link applies backpressure
//! instead of dropping events. Every worker validates its events again before
//! sending them.
//!
//! ## Configuration
//!
//! The YAML format of a configuration file is as follows:
//!
//! ```yml
//! source_path: /data/run_0042.dma
//! log_path: readout_relay.log
//! node_id: 769
//! channel_mask: 281474976710655
//! n_workers: 5
//! event_stride: 1
//! downstream_host: 127.0.0.1
//! base_port: 46000
//! send_timeout_ms: 5000
//! connect_retries: 10
//! report_interval_secs: 10
//! permissive_acknowledged: false
//! ```
//!
//! Worker `i` connects to `downstream_host:base_port + i`. Missing fields take their
//! default values.
//!
//! ## Output
//!
//! Each event is sent in a frame of six header words (total length in words, protocol
//! tag, board count, experiment/run, reserved, node id), the event itself, and two
//! trailer words ending with the terminator `0x7FFF0007`. All words are little-endian.
pub mod channel_set;
pub mod config;
pub mod constants;
pub mod crc;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod fragment;
pub mod ingest_status;
pub mod process;
pub mod reassembler;
pub mod reducer;
pub mod sender;
pub mod source;
pub mod synthetic;
pub mod telemetry;
pub mod validator;
