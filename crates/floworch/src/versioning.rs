// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The version-management catalog, consulted as a read-only oracle.
//!
//! The orchestrator never mutates the catalog; it asks three questions:
//! what lifecycle status a pinned service version is in, which schemas the
//! version declares on its input and output sides, and whether a
//! producer/consumer version pair has been flagged incompatible.
//!
//! [`StaticVersionCatalog`] is the in-process implementation used by tests
//! and embedders; a deployment backed by a remote catalog snapshots its
//! answers into the same shape.

use crate::definition::{MergeStrategyKind, ServiceRef};
use crate::error::{Error, Result};
use crate::schema::DataSchema;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lifecycle status of a service version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    /// Fully supported.
    Active,
    /// Usable, but executions referencing it emit a warning.
    Deprecated,
    /// Refused at execution time.
    Archived,
}

/// What an exporter service can do at a convergence point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeCapabilities {
    /// Strategy families the exporter declares support for.
    pub supported: Vec<MergeStrategyKind>,
    /// Whether the exporter may fire with only a subset of its producing
    /// branches (the rest having failed).
    pub accepts_partial_input: bool,
}

impl Default for MergeCapabilities {
    fn default() -> Self {
        Self {
            supported: vec![MergeStrategyKind::LastWriteWins],
            accepts_partial_input: false,
        }
    }
}

impl MergeCapabilities {
    /// Capabilities supporting every strategy family and partial input.
    pub fn everything() -> Self {
        Self {
            supported: vec![
                MergeStrategyKind::LastWriteWins,
                MergeStrategyKind::PriorityBased,
                MergeStrategyKind::FieldLevel,
            ],
            accepts_partial_input: true,
        }
    }

    /// Whether the given strategy family is supported.
    pub fn supports(&self, kind: MergeStrategyKind) -> bool {
        self.supported.contains(&kind)
    }
}

/// Read-only oracle answering version questions during validation.
pub trait VersionCatalog: Send + Sync {
    /// Lifecycle status of a pinned service version.
    fn service_status(&self, service: &ServiceRef) -> Result<VersionStatus>;

    /// Schema the service consumes, if it declares one.
    fn input_schema(&self, service: &ServiceRef) -> Result<Option<DataSchema>>;

    /// Schema the service produces, if it declares one.
    fn output_schema(&self, service: &ServiceRef) -> Result<Option<DataSchema>>;

    /// Merge capabilities of an exporter service.
    fn merge_capabilities(&self, service: &ServiceRef) -> Result<MergeCapabilities>;

    /// Whether the producer/consumer version pair is allowed. Pairs are
    /// compatible unless the matrix marks them otherwise.
    fn compatible(&self, producer: &ServiceRef, consumer: &ServiceRef) -> Result<bool>;
}

/// One registered service version.
#[derive(Clone, Debug)]
pub struct ServiceRegistration {
    service: ServiceRef,
    status: VersionStatus,
    input_schema: Option<DataSchema>,
    output_schema: Option<DataSchema>,
    merge: MergeCapabilities,
}

impl ServiceRegistration {
    /// Register a service version, ACTIVE by default.
    pub fn new(service: ServiceRef) -> Self {
        Self {
            service,
            status: VersionStatus::Active,
            input_schema: None,
            output_schema: None,
            merge: MergeCapabilities::default(),
        }
    }

    /// Override the lifecycle status.
    pub fn status(mut self, status: VersionStatus) -> Self {
        self.status = status;
        self
    }

    /// Declare the input-side schema.
    pub fn input_schema(mut self, schema: DataSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Declare the output-side schema.
    pub fn output_schema(mut self, schema: DataSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Declare merge capabilities (exporters only).
    pub fn merge_capabilities(mut self, merge: MergeCapabilities) -> Self {
        self.merge = merge;
        self
    }
}

#[derive(Clone, Debug)]
struct CatalogEntry {
    status: VersionStatus,
    input_schema: Option<DataSchema>,
    output_schema: Option<DataSchema>,
    merge: MergeCapabilities,
}

/// In-memory [`VersionCatalog`].
#[derive(Default)]
pub struct StaticVersionCatalog {
    services: RwLock<HashMap<ServiceRef, CatalogEntry>>,
    incompatible: RwLock<HashSet<(ServiceRef, ServiceRef)>>,
}

impl StaticVersionCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a service version.
    pub fn register(&self, registration: ServiceRegistration) -> &Self {
        self.services.write().insert(
            registration.service,
            CatalogEntry {
                status: registration.status,
                input_schema: registration.input_schema,
                output_schema: registration.output_schema,
                merge: registration.merge,
            },
        );
        self
    }

    /// Mark a directed producer/consumer pair incompatible.
    pub fn forbid(&self, producer: ServiceRef, consumer: ServiceRef) -> &Self {
        self.incompatible.write().insert((producer, consumer));
        self
    }

    fn entry(&self, service: &ServiceRef) -> Result<CatalogEntry> {
        self.services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound {
                service_id: service.service_id.clone(),
                version: service.version.to_string(),
            })
    }
}

impl VersionCatalog for StaticVersionCatalog {
    fn service_status(&self, service: &ServiceRef) -> Result<VersionStatus> {
        Ok(self.entry(service)?.status)
    }

    fn input_schema(&self, service: &ServiceRef) -> Result<Option<DataSchema>> {
        Ok(self.entry(service)?.input_schema)
    }

    fn output_schema(&self, service: &ServiceRef) -> Result<Option<DataSchema>> {
        Ok(self.entry(service)?.output_schema)
    }

    fn merge_capabilities(&self, service: &ServiceRef) -> Result<MergeCapabilities> {
        Ok(self.entry(service)?.merge)
    }

    fn compatible(&self, producer: &ServiceRef, consumer: &ServiceRef) -> Result<bool> {
        // Both sides must exist before the pair can be judged.
        self.entry(producer)?;
        self.entry(consumer)?;
        Ok(!self
            .incompatible
            .read()
            .contains(&(producer.clone(), consumer.clone())))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};

    #[test]
    fn test_unknown_service_errors() {
        let catalog = StaticVersionCatalog::new();
        let missing = ServiceRef::new("ghost", "1.0.0");
        assert!(matches!(
            catalog.service_status(&missing),
            Err(Error::ServiceNotFound { .. })
        ));
    }

    #[test]
    fn test_status_and_schemas() {
        let catalog = StaticVersionCatalog::new();
        let svc = ServiceRef::new("json-proc", "1.0.0");
        catalog.register(
            ServiceRegistration::new(svc.clone())
                .status(VersionStatus::Deprecated)
                .input_schema(DataSchema::new(
                    "RawData",
                    1,
                    vec![FieldSpec::required("body", FieldType::String)],
                ))
                .output_schema(DataSchema::new("TransformedData", 1, vec![])),
        );

        assert_eq!(
            catalog.service_status(&svc).unwrap(),
            VersionStatus::Deprecated
        );
        assert_eq!(catalog.input_schema(&svc).unwrap().unwrap().name, "RawData");
        assert_eq!(
            catalog.output_schema(&svc).unwrap().unwrap().name,
            "TransformedData"
        );
    }

    #[test]
    fn test_compatibility_defaults_to_allowed() {
        let catalog = StaticVersionCatalog::new();
        let imp_v3 = ServiceRef::new("imp", "3.0.0");
        let p1_v1 = ServiceRef::new("p1", "1.0.0");
        catalog.register(ServiceRegistration::new(imp_v3.clone()));
        catalog.register(ServiceRegistration::new(p1_v1.clone()));

        assert!(catalog.compatible(&imp_v3, &p1_v1).unwrap());

        catalog.forbid(imp_v3.clone(), p1_v1.clone());
        assert!(!catalog.compatible(&imp_v3, &p1_v1).unwrap());
        // The reverse direction is untouched.
        assert!(catalog.compatible(&p1_v1, &imp_v3).unwrap());
    }

    #[test]
    fn test_merge_capability_check() {
        let caps = MergeCapabilities::everything();
        assert!(caps.supports(MergeStrategyKind::FieldLevel));
        assert!(caps.accepts_partial_input);

        let default = MergeCapabilities::default();
        assert!(default.supports(MergeStrategyKind::LastWriteWins));
        assert!(!default.supports(MergeStrategyKind::FieldLevel));
    }
}
