//! # Plugin Index
//!
//! Indexing orchestration for a catalog of plugin marketplaces, the plugins
//! they publish, and MCP server registries.
//!
//! Source-specific crawlers ([`traits::Connector`]) feed raw records into an
//! idempotent upsert engine that resolves every record to a stable entity,
//! appends popularity history, and soft-deletes entities that disappear from
//! a full crawl. Runs are serialized by a durable lock in SQLite, so triggers
//! racing from different processes never interleave.
//!
//! ## Architecture
//!
//! ```text
//!  POST /admin/reindex ─┐
//!  GET  /cron/*  ───────┼──▶ RunCoordinator::trigger ──▶ Stage × N ──▶ SQLite
//!  scheduled (retry) ───┘      (run lock, budget)         │            entities
//!                                                         │            stat_snapshots
//!                                        Connector ──▶ upsert ──▶ reconcile
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pidx init                     # create database
//! pidx sources                  # show connector per stage
//! pidx run all                  # index everything now
//! pidx scheduled                # run today's scheduled pipeline
//! pidx serve                    # start the trigger server
//! pidx status                   # counts and last runs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`traits`] | Connector contract and registry |
//! | [`connector_file`] | JSON file connector |
//! | [`connector_http`] | HTTP JSON feed connector |
//! | [`identity`] | Identity keys |
//! | [`upsert`] | Upsert and dedup engine |
//! | [`reconcile`] | Staleness reconciliation |
//! | [`runs`] | Run records, run lock, checkpoints |
//! | [`coordinator`] | Run coordinator |
//! | [`trigger`] | Admission checks and retry |
//! | [`schedule`] | Weekly scheduled trigger |
//! | [`server`] | Trigger HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector_file;
pub mod connector_http;
pub mod coordinator;
pub mod db;
pub mod entities;
pub mod error;
pub mod history;
pub mod identity;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod reconcile;
pub mod runs;
pub mod schedule;
pub mod server;
pub mod sources;
pub mod stats;
pub mod traits;
pub mod trigger;
pub mod upsert;
