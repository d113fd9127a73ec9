//! Storage layer for workflows, runs, events and approvals.
//!
//! Collections are accessed through the [`DbCollection`] trait so a backend
//! only has to provide the five collections of [`DbStore`]. The bundled
//! backend is the in-memory [`MemStore`].

pub mod data;
mod db;
pub mod query;
mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Result, hitl::ApprovalRequest, runtime::WorkflowRun};

use data::*;
use query::*;

pub use db::MemStore;
pub use store::Store;

/// Paginated query result.
#[derive(Debug, Deserialize, Serialize)]
pub struct PageData<T> {
    /// Total number of matching records.
    pub count: usize,
    /// Current page number (1-based).
    pub page_num: usize,
    /// Total number of pages.
    pub page_count: usize,
    /// Number of records per page.
    pub page_size: usize,
    /// Records in the current page.
    pub rows: Vec<T>,
}

/// Trait for database collection operations.
pub trait DbCollection: Send + Sync {
    /// The type of items stored in this collection.
    type Item;

    /// Checks if a record with the given ID exists.
    fn exists(
        &self,
        id: &str,
    ) -> Result<bool>;

    /// Finds a record by ID.
    fn find(
        &self,
        id: &str,
    ) -> Result<Self::Item>;

    /// Queries records with pagination and filtering.
    fn query(
        &self,
        query: &Query,
    ) -> Result<PageData<Self::Item>>;

    /// Creates a new record.
    fn create(
        &self,
        data: &Self::Item,
    ) -> Result<bool>;

    /// Updates an existing record.
    fn update(
        &self,
        data: &Self::Item,
    ) -> Result<bool>;

    /// Deletes a record by ID.
    fn delete(
        &self,
        id: &str,
    ) -> Result<bool>;
}

/// Storage backend.
pub trait DbStore {
    fn workflows(&self) -> Arc<dyn DbCollection<Item = WorkflowRecord>>;

    /// runs that are live or still inside their retention window
    fn runs(&self) -> Arc<dyn DbCollection<Item = WorkflowRun>>;

    /// runs moved out of the active set after retention
    fn archive(&self) -> Arc<dyn DbCollection<Item = WorkflowRun>>;

    fn events(&self) -> Arc<dyn DbCollection<Item = EventRecord>>;

    fn approvals(&self) -> Arc<dyn DbCollection<Item = ApprovalRequest>>;
}
