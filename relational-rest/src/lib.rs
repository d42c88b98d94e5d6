//! Relational REST exposes objects persisted through an ORM as addressable JSON resources.
//!
//! An application describes its data model once, as a set of
//! [resource classes](resources::ModelResourceClass). Each class lists the [fields] of one model
//! that appear on the wire, and how they appear: as plain attributes, as references to other
//! resources, or as nested representations of related objects. Classes are served through
//! [collections](resources::Collection), and everything is registered with an [`Api`](api::Api),
//! which resolves request paths to [resources] and handles
//!
//! * serialization of objects, including relations followed through dotted attribute paths,
//! * writes of nested payloads, creating, updating and unlinking related objects as needed,
//! * [eager loading](related) of every relation a representation will touch,
//! * [filtering](filters) and paging of collections,
//! * [validation](validation) of whole payloads before anything is written,
//! * per-field write authorization and optimistic concurrency through entity tags.
//!
//! The library is agnostic to the underlying database: it talks to it only through the traits in
//! [orm]. An in-memory implementation of those traits lives in [orm::mock], which is useful for
//! lightweight testing. It is also agnostic to the web framework serving it: [`Api::handle`]
//! consumes and produces plain [`Request`](api::Request) and [`Response`](api::Response) values,
//! and wire encoding is delegated to a pluggable [`Formatter`](formatter::Formatter).
//!
//! [`Api::handle`]: api::Api::handle

use std::sync::Once;
use tracing_subscriber::EnvFilter;

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod fields;
pub mod filters;
pub mod formatter;
pub mod orm;
pub mod prelude;
pub mod related;
pub mod resources;
pub mod validation;

/// Initialize tracing.
pub fn init_logging() {
    static ONCE: Once = Once::new();

    ONCE.call_once(|| {
        // A hook may already be installed by the embedding application.
        let _ = color_eyre::install();
        tracing_subscriber::fmt()
            .with_ansi(true)
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    });
}
