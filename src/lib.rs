//! # iRobot Gateway
//!
//! An authenticating HTTP gateway that precaches immutable objects from a
//! remote content-addressed store onto local disk and serves them, whole
//! or by byte range, to authorized clients.
//!
//! - `tracking`: durable system of record for every precache entry (§4.1)
//! - `precache`: admission, eviction, expiry and refetch orchestration (§4.2)
//! - `checksum`: whole-file/chunk MD5 generation and sub-range lookup (§4.3)
//! - `http`: the per-request state machine and its middleware chain (§4.4)
//! - `remote`: the external object-store collaborator (§2)
//! - `auth`: pluggable request authentication (§4.4)

pub mod auth;
pub mod checksum;
pub mod common;
pub mod config;
pub mod errors;
pub mod http;
pub mod precache;
pub mod remote;
pub mod tracking;
