//! # kde-builder
//!
//! A source-driven build orchestrator for large federations of
//! interdependent repositories.
//!
//! Given a declarative configuration, a remote project-metadata catalog,
//! and a branch-group policy, kde-builder resolves the effective project
//! list, orders it by dependency, and drives every project through
//! update → configure → build → (test) → install, streaming progress to
//! the operator and recording persistent state for resume and
//! rebuild-failures runs.
//!
//! ## Pipeline
//!
//! 1. [`config::load_config`] reads the YAML configuration (projects,
//!    groups, overrides, includes) into a [`config::ConfigDocument`].
//! 2. [`resolver::Resolver`] turns selectors, groups, overrides, and
//!    catalog wildcards into concrete [`project::Project`]s with fully
//!    layered options.
//! 3. [`graph`] builds the dependency graph from the Makefile-like
//!    declarations in [`deps`], detects cycles, propagates votes, and
//!    produces a stable, reproducible build order.
//! 4. [`taskmgr::TaskManager`] runs the update side (a separate worker
//!    process on concurrent runs, see [`worker`]) and the build side
//!    ([`runner::BuildRunner`] over the [`buildsystem`] flavors),
//!    exchanging [`ipc`] messages.
//! 5. [`app::run`] wraps the whole flow and finalizes: persistent
//!    [`state`], log GC ([`logdir`]), and the failure report
//!    ([`debug_order`]).
//!
//! ## Key types
//!
//! - `Project` — the atomic unit of work, with merged options
//! - `BuildContext` — the global option layer and layered option reads
//! - `ModuleGraph` — dependency graph with votes and build flags
//! - `BuildFlavor` — per-build-system configure/build/install hooks
//! - `UpdateTask` — serializable per-project instructions for the updater
//!
//! The CLI front end lives in the `kde-builder-cli` crate.

/// Top-level application flow: configuration to exit code.
pub mod app;

/// Build-system flavors and detection.
pub mod buildsystem;

/// Project catalog reader and branch-group resolver.
pub mod catalog;

/// YAML configuration reader.
pub mod config;

/// The global build context and layered option resolution.
pub mod context;

/// Ranking of failures from most to least interesting.
pub mod debug_order;

/// Dependency declaration grammar.
pub mod deps;

/// Typed error taxonomy.
pub mod error;

/// Dependency graph, cycle detection, votes, and build order.
pub mod graph;

/// Typed, length-framed updater/builder messages.
pub mod ipc;

/// Single-instance lock keyed by the configuration directory.
pub mod lock;

/// Per-run log directories, `latest` symlinks, and GC.
pub mod logdir;

/// Per-entity option stores and the option registry.
pub mod options;

/// Build phases and per-project phase lists.
pub mod phases;

/// Logged subprocess execution.
pub mod process;

/// Projects: the atomic unit of work.
pub mod project;

/// User-facing output routing.
pub mod report;

/// Selector resolution.
pub mod resolver;

/// The per-project build pipeline.
pub mod runner;

/// Signal supervisor (graceful and hard stop flags).
pub mod signals;

/// Persistent per-project state across runs.
pub mod state;

/// The update/build task manager.
pub mod taskmgr;

/// Git source updater.
pub mod updater;

/// The update worker process and its plumbing.
pub mod worker;
