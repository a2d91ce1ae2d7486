//! Cache warm-up ahead of first render, and the HTTP boundary that triggers it.

mod routes;
mod warmer;

pub use routes::create_router;
pub use warmer::{warm_housing_unit, PrefetchMode, PrefetchReport, PrefetchWarmer};
