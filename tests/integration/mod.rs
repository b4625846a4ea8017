//! Integration test suite for agentflow.
//!
//! These tests drive manifests through the public scheduler API and
//! verify that validation, dispatch, retries, review gating,
//! cancellation and the built-in agents work together correctly.
//!
//! # Test Categories
//!
//! - `execution`: ordering, retries, cascades, concurrency, retrieval
//! - `review_flow`: human review approval, rejection and timeout
//! - `cancellation`: draining and aborting on cancel
//! - `builtin_pipeline`: built-in agents against a git repo and sandbox
//!
//! # CI Compatibility
//!
//! These tests use scripted agents and a scripted container engine and
//! never start containers or call an LLM, making them safe to run in CI
//! environments.


mod cancellation;
mod execution;
mod review_flow;
