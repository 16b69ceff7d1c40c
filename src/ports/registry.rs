// file: src/ports/registry.rs
// version: 1.0.0
// guid: 7109c538-2055-4cc1-a1d8-9a7b04acc0ae

//! In-memory port registry with allocation rules and conflict repair

use super::{validate_range, PortAssignment, PortError, PortProbe, Service};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Range used for randomly suggested ports
const SUGGEST_RANGE: std::ops::RangeInclusive<u16> = 20000..=60000;

/// Result of a successful allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub assignment: PortAssignment,
    pub warnings: Vec<String>,
}

/// A correction applied while loading a persisted registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub service: Service,
    pub previous: String,
    pub port: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRegistry {
    path: PathBuf,
    assignments: BTreeMap<Service, PortAssignment>,
    repairs: Vec<Repair>,
}

impl PortRegistry {
    /// Registry with every service on its documented default
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        let assignments = Service::ALL
            .into_iter()
            .map(|s| (s, PortAssignment::new(s, s.default_port())))
            .collect();
        Self {
            path: path.into(),
            assignments,
            repairs: Vec::new(),
        }
    }

    /// Build a registry from raw `KEY=VALUE` entries, repairing invalid or
    /// conflicting values so a previous run can never block this one
    pub fn from_entries(path: impl Into<PathBuf>, entries: &[(String, String)]) -> Self {
        let mut raw: BTreeMap<Service, &str> = BTreeMap::new();
        for (key, value) in entries {
            match Service::from_config_key(key) {
                Some(service) => {
                    if raw.insert(service, value.as_str()).is_some() {
                        warn!("Duplicate {} entry in ports file; last value wins", key);
                    }
                }
                None => warn!("Ignoring unknown key '{}' in ports file", key),
            }
        }

        let mut used = BTreeSet::new();
        let mut assignments = BTreeMap::new();
        let mut repairs = Vec::new();

        for service in Service::ALL {
            let (mut port, mut reason) = match raw.get(&service) {
                None => {
                    debug!("{} missing from ports file, using default", service.config_key());
                    (service.default_port(), None)
                }
                Some(value) => match value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| PortError::InvalidValue {
                        key: service.config_key().to_string(),
                        value: value.to_string(),
                    })
                    .and_then(validate_range)
                {
                    Ok(port) => (port, None),
                    Err(e) => (service.default_port(), Some(e.to_string())),
                },
            };

            if used.contains(&port) {
                let owner = assignments
                    .values()
                    .find(|a: &&PortAssignment| a.port == port)
                    .map(|a| a.service.name())
                    .unwrap_or("another service");
                reason = Some(format!("port {} is already assigned to {}", port, owner));
                port = first_free_from(service.default_port(), &used);
            }

            if let Some(reason) = reason {
                let previous = raw.get(&service).map(|v| v.to_string()).unwrap_or_default();
                warn!(
                    "Repaired {}: '{}' -> {} ({})",
                    service.config_key(),
                    previous,
                    port,
                    reason
                );
                repairs.push(Repair {
                    service,
                    previous,
                    port,
                    reason,
                });
            }

            used.insert(port);
            assignments.insert(service, PortAssignment::new(service, port));
        }

        Self {
            path: path.into(),
            assignments,
            repairs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, service: Service) -> Option<&PortAssignment> {
        self.assignments.get(&service)
    }

    /// Assigned port, or the documented default when unassigned
    pub fn port(&self, service: Service) -> u16 {
        self.get(service)
            .map(|a| a.port)
            .unwrap_or_else(|| service.default_port())
    }

    pub fn assignments(&self) -> impl Iterator<Item = &PortAssignment> {
        self.assignments.values()
    }

    pub fn repairs(&self) -> &[Repair] {
        &self.repairs
    }

    /// Assign `proposed` to `service`.
    ///
    /// Rejects out-of-range ports and ports held by another service. A
    /// privileged port or a socket already bound on the host only warns,
    /// since the service that will bind it may not exist yet.
    pub fn allocate(
        &mut self,
        service: Service,
        proposed: u32,
        probe: &dyn PortProbe,
    ) -> Result<Allocation, PortError> {
        let port = validate_range(proposed)?;

        if let Some(existing) = self
            .assignments
            .values()
            .find(|a| a.port == port && a.service != service)
        {
            return Err(PortError::Collision {
                port,
                existing: existing.service,
                requested: service,
            });
        }

        let mut warnings = Vec::new();
        if port < 1024 {
            warnings.push(format!(
                "port {} for {} is privileged (<1024)",
                port, service
            ));
        }

        let unchanged = self.get(service).map(|a| a.port) == Some(port);
        if !unchanged && probe.is_port_bound(port) {
            warnings.push(format!(
                "port {} for {} is already bound on this host",
                port, service
            ));
        }

        for warning in &warnings {
            warn!("{}", warning);
        }

        let assignment = PortAssignment::new(service, port);
        self.assignments.insert(service, assignment.clone());
        Ok(Allocation {
            assignment,
            warnings,
        })
    }

    /// Return a service to its documented default
    pub fn reset(&mut self, service: Service, probe: &dyn PortProbe) -> Result<Allocation, PortError> {
        self.allocate(service, u32::from(service.default_port()), probe)
    }

    /// Pick a random free high port for `service`
    pub fn suggest(&self, service: Service, probe: &dyn PortProbe) -> u16 {
        let taken: BTreeSet<u16> = self
            .assignments
            .values()
            .filter(|a| a.service != service)
            .map(|a| a.port)
            .collect();
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let candidate = rng.gen_range(SUGGEST_RANGE);
            if !taken.contains(&candidate) && !probe.is_port_bound(candidate) {
                return candidate;
            }
        }
        first_free_from(*SUGGEST_RANGE.start(), &taken)
    }
}

/// First port at or above `start` (wrapping to 1) that is not in `used`
fn first_free_from(start: u16, used: &BTreeSet<u16>) -> u16 {
    (start..=u16::MAX)
        .chain(1..start)
        .find(|p| !used.contains(p))
        .unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never_bound(_: u16) -> bool {
        false
    }

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_allocate_rejects_collision() {
        let mut registry = PortRegistry::with_defaults("/tmp/ports.conf");
        registry.allocate(Service::Ssh, 2222, &never_bound).unwrap();

        let err = registry
            .allocate(Service::KubeApi, 2222, &never_bound)
            .unwrap_err();
        assert_eq!(
            err,
            PortError::Collision {
                port: 2222,
                existing: Service::Ssh,
                requested: Service::KubeApi
            }
        );
        assert_eq!(registry.port(Service::KubeApi), 6443);
    }

    #[test]
    fn test_allocate_privileged_port_warns() {
        let mut registry = PortRegistry::with_defaults("/tmp/ports.conf");
        let allocation = registry.allocate(Service::Ssh, 222, &never_bound).unwrap();
        assert_eq!(allocation.assignment.port, 222);
        assert_eq!(allocation.warnings.len(), 1);
        assert!(allocation.warnings[0].contains("privileged"));
    }

    #[test]
    fn test_allocate_out_of_range() {
        let mut registry = PortRegistry::with_defaults("/tmp/ports.conf");
        assert_eq!(
            registry.allocate(Service::Ssh, 0, &never_bound),
            Err(PortError::OutOfRange(0))
        );
        assert_eq!(
            registry.allocate(Service::Ssh, 65536, &never_bound),
            Err(PortError::OutOfRange(65536))
        );
    }

    #[test]
    fn test_bound_port_is_soft_warning() {
        let mut registry = PortRegistry::with_defaults("/tmp/ports.conf");
        let bound = |port: u16| port == 16443;
        let allocation = registry.allocate(Service::KubeApi, 16443, &bound).unwrap();
        assert_eq!(allocation.warnings.len(), 1);
        assert!(allocation.warnings[0].contains("already bound"));

        // Re-allocating the same port is a no-op and does not warn again
        let again = registry.allocate(Service::KubeApi, 16443, &bound).unwrap();
        assert!(again.warnings.is_empty());
    }

    #[test]
    fn test_conflicting_entries_are_repaired() {
        let registry = PortRegistry::from_entries(
            "/tmp/ports.conf",
            &entries(&[("SSH_PORT", "2222"), ("K3S_API_PORT", "2222")]),
        );
        assert_eq!(registry.port(Service::Ssh), 2222);
        assert_eq!(registry.port(Service::KubeApi), 6443);
        assert_eq!(registry.repairs().len(), 1);
        assert_eq!(registry.repairs()[0].service, Service::KubeApi);
    }

    #[test]
    fn test_repair_skips_taken_default() {
        let registry = PortRegistry::from_entries(
            "/tmp/ports.conf",
            &entries(&[("SSH_PORT", "6443"), ("K3S_API_PORT", "6443")]),
        );
        assert_eq!(registry.port(Service::Ssh), 6443);
        assert_eq!(registry.port(Service::KubeApi), 6444);
    }

    #[test]
    fn test_invalid_and_missing_values_fall_back() {
        let registry = PortRegistry::from_entries(
            "/tmp/ports.conf",
            &entries(&[("SSH_PORT", "not-a-port"), ("EXTRA", "1")]),
        );
        assert_eq!(registry.port(Service::Ssh), 22);
        assert_eq!(registry.port(Service::KubeApi), 6443);
        assert_eq!(registry.repairs().len(), 1);
        assert_eq!(registry.repairs()[0].previous, "not-a-port");
    }

    #[test]
    fn test_suggest_avoids_taken_ports() {
        let registry = PortRegistry::with_defaults("/tmp/ports.conf");
        let port = registry.suggest(Service::Ssh, &never_bound);
        assert!(SUGGEST_RANGE.contains(&port));
        assert_ne!(port, registry.port(Service::KubeApi));
    }
}
