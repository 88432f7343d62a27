use crate::docker::DockerRuntime;
use crate::forward::ForwardingHandle;
use crate::labels::LabelMap;
use crate::registry::ContainerRegistry;

/// Everything the sweeps and per-container tasks share.
pub(crate) struct RelayState {
    pub docker: DockerRuntime,
    pub registry: ContainerRegistry,
    pub labels: LabelMap,
    /// Opaque config value copied verbatim into every record.
    pub marker: serde_json::Value,
    pub forward: ForwardingHandle,
}
