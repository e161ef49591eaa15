/*! Integration tests for causal trees.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - weave: Convergence of weaves built from the same atoms in any order
 * - tree: CausalTree batching, garbage collection, factories and stored formats
 * - auth: Signed atoms moving between validating trees
 * - store: Persisting and reloading trees
 * - realtime: Trees kept in sync through an in-process hub
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("causal_trees=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod auth;
mod helpers;
mod realtime;
mod store;
mod tree;
mod weave;
