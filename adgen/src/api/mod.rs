//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request and response bodies
//!
//! # Routes
//!
//! - `POST /generate/{operation}`: enqueue a job and reserve its credits (`202`)
//! - `GET /generate/status/{job_id}`: job status, result or error
//! - `DELETE /generate/{job_id}`: cancel a job that has not started and refund it
//! - `GET /credits/balance`, `GET /credits/transactions`: the caller's account
//! - `GET /healthz`: liveness and queue depths
//!
//! Every route except `/healthz` acts for the user named in the `X-User-Id` header
//! (see [`crate::auth`]).

pub mod handlers;
pub mod models;
