//! Unit and scenario tests for the workflow components, run against
//! in-memory collaborators.

mod support;

mod scenario;
