//! Demo plugins used by this crate's own tests (and by `octopus-cli`'s
//! `--dry-run` smoke test) to exercise the registry, graph builder, and
//! scheduler end to end. Not the real plugin catalogue (that lives outside
//! this crate, as described at the top of the crate's documentation).

pub mod examples;
