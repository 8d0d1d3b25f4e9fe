//! # casewatch
//!
//! Collection, deduplication, change tracking, and hotspot clustering for
//! missing-person and AMBER alert records.
//!
//! casewatch gathers records from heterogeneous, unreliable upstreams
//! (a paginated search API, scraped HTML pages, RSS/Atom feeds, and a
//! weather-alert feed that carries Child Abduction Emergencies), normalizes
//! them into one schema, decides whether each is new, a duplicate, or an
//! update to a stored case, and groups geolocated cases into clusters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐   ┌──────────┐
//! │ Connectors  │──▶│   ingest     │──▶│ pending queue │──▶│ process  │
//! │ API/HTML/   │   │ (scheduler)  │   │   (SQLite)    │   │ validate │
//! │ RSS/Weather │   └──────────────┘   └───────────────┘   │ classify │
//! └─────────────┘                                          └────┬─────┘
//!                                                               │
//!                      ┌──────────────┬─────────────────────────┤
//!                      ▼              ▼                         ▼
//!                ┌──────────┐   ┌───────────┐            ┌────────────┐
//!                │  cases   │   │  change   │──────────▶ │ AlertSink  │
//!                │ +geocode │   │  events   │            └────────────┘
//!                └────┬─────┘   └───────────┘
//!                     ▼
//!               ┌───────────┐
//!               │ clustering│
//!               └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cw init                       # create database
//! cw sources                    # list configured sources
//! cw sync all                   # collect every active source once
//! cw process                    # validate + classify pending records
//! cw geocode pending            # add coordinates to stored cases
//! cw cluster --algorithm risk   # print hotspot clusters as JSON
//! cw run                        # scheduler loop until Ctrl-C
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`scheduler`] | Source scheduling, health, bulk collection |
//! | [`ingest`] | One collection cycle |
//! | [`connector_api`] | Paginated JSON search API |
//! | [`connector_html`] | Scraped HTML pages |
//! | [`connector_rss`] | RSS/Atom feeds |
//! | [`connector_weather`] | Child Abduction Emergency weather alerts |
//! | [`validate`] | Record validation and duplicate detection |
//! | [`classify`] | Change classification |
//! | [`process`] | Pending record processing |
//! | [`geocode`] | Geocoding provider chain and cache |
//! | [`sqlite_store`] | SQLite record store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod alerting;
pub mod classify;
pub mod config;
pub mod connector_api;
pub mod connector_html;
pub mod connector_rss;
pub mod connector_weather;
pub mod db;
pub mod fetch;
pub mod geocode;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod normalize;
pub mod process;
pub mod progress;
pub mod rate_limit;
pub mod scheduler;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
pub mod traits;
pub mod validate;
