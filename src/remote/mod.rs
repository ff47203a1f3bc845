// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The remote validation/storage service.
//!
//! - [`traits`]: the [`RemoteService`](traits::RemoteService) contract and its error type
//! - [`sql`]: MySQL/SQLite implementation over `sqlx`
//! - [`memory`]: in-process implementation with fault injection
//! - [`guarded`]: circuit-breaker decorator for any implementation

pub mod guarded;
pub mod memory;
pub mod sql;
pub mod traits;
