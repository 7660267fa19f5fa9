//! Subscription detection stack.
//!
//! Pure, synchronous code: no network, no database, no clocks other than the
//! `now` the caller passes in. The chunk engine feeds it messages and
//! metadata; it answers with scored candidates.
//!
//! - `normalize`: domains, bodies, link extraction, closed domain sets
//! - `classifier`: transactional vs marketing flags and the quick screen
//! - `merchant`: tiered merchant resolution against directory + overrides
//! - `extract`: amounts, cadences, renewal dates, plans, platform merchants
//! - `candidate`: per-message candidate builder
//! - `cluster`: cadence clustering over metadata when bodies are absent
//! - `aggregate`: fingerprints, per-chunk merge, best-per-merchant dedupe

pub mod aggregate;
pub mod candidate;
pub mod classifier;
pub mod cluster;
pub mod extract;
pub mod merchant;
pub mod normalize;
