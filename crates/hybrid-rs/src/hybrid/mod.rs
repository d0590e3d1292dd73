//! Backend that splits functions by placement and runs each piece on a member backend.

mod cache;
mod config;
mod engine;

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::backend::registry;
use crate::backend::spec::{Backend, BackendError, BackendResult, Operation, TensorSpec};
use crate::backend::validate_call;
use crate::env;
use crate::graph::{Function, FunctionId};
use crate::partition::partition;
use crate::placement::{assign_placement, CapabilityPlacement, Placement, PlacementPolicy};
use crate::tensor::TensorRef;

pub use cache::{CacheStats, CompilationCache, FunctionInstance};
pub use config::HybridConfig;

type Member = (Placement, Arc<dyn Backend>);

/// Composes several backends behind the [`Backend`] contract.
///
/// On first compile of a function the backend clones it, tags the clone with the placement
/// policy, partitions it into single-placement sub-functions, and compiles each piece on
/// its member. The result is cached by the source function's identity. Calls validate the
/// caller tensors, then run the sub-functions in order and hand tensors across boundaries.
pub struct HybridBackend {
    members: Vec<Member>,
    policy: Box<dyn PlacementPolicy>,
    cache: CompilationCache,
    verify_partitions: bool,
}

impl HybridBackend {
    /// Uses each backend's own name as its placement. Earlier backends take priority.
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> BackendResult<Self> {
        let members = backends
            .into_iter()
            .map(|backend| (Placement::new(backend.backend_name()), backend))
            .collect();
        Self::with_members(members)
    }

    /// Uses explicit placements, in priority order.
    pub fn with_members(members: Vec<(Placement, Arc<dyn Backend>)>) -> BackendResult<Self> {
        if members.is_empty() {
            return Err(BackendError::config("a hybrid backend needs at least one member"));
        }
        for (index, (placement, _)) in members.iter().enumerate() {
            if members[..index].iter().any(|(seen, _)| seen == placement) {
                return Err(BackendError::config(format!(
                    "placement `{placement}` is assigned to two backends"
                )));
            }
        }
        let policy = CapabilityPlacement::new(members.clone());
        Ok(Self {
            members,
            policy: Box::new(policy),
            cache: CompilationCache::new(),
            verify_partitions: false,
        })
    }

    /// Resolves every configured name through the backend registry.
    pub fn from_config(config: &HybridConfig) -> BackendResult<Self> {
        let config = config.clone().normalized()?;
        let members = config
            .backends
            .iter()
            .map(|name| {
                registry::create_backend(name)
                    .map(|backend| (Placement::new(name), backend))
                    .ok_or_else(|| {
                        BackendError::config(format!(
                            "unknown backend `{name}` (registered: {:?})",
                            registry::list_backends()
                        ))
                    })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self::with_members(members)?.with_partition_verification(config.verify_partitions))
    }

    /// Replaces the default capability-based placement policy.
    pub fn with_policy(mut self, policy: impl PlacementPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_partition_verification(mut self, enabled: bool) -> Self {
        self.verify_partitions = enabled;
        self
    }

    pub fn placements(&self) -> Vec<Placement> {
        self.members
            .iter()
            .map(|(placement, _)| placement.clone())
            .collect()
    }

    pub fn member(&self, placement: &Placement) -> Option<&Arc<dyn Backend>> {
        self.members
            .iter()
            .find(|(candidate, _)| candidate == placement)
            .map(|(_, backend)| backend)
    }

    fn require_member(&self, placement: &Placement) -> BackendResult<&Arc<dyn Backend>> {
        self.member(placement).ok_or_else(|| {
            BackendError::execution(format!("no member backend for placement `{placement}`"))
        })
    }

    /// Compiles `function` if needed and returns its cached instance.
    pub fn compile_instance(&self, function: &Function) -> BackendResult<Arc<FunctionInstance>> {
        self.cache
            .get_or_build(function.id(), || self.build_instance(function))
            .map_err(|err| {
                warn!("compiling {} ({}) failed: {err}", function.name(), function.id());
                err
            })
    }

    /// Returns the cached instance of a function compiled earlier.
    pub fn instance(&self, id: FunctionId) -> Option<Arc<FunctionInstance>> {
        self.cache.get(id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn build_instance(&self, function: &Function) -> BackendResult<FunctionInstance> {
        let mut placed = function.clone_function();
        assign_placement(&mut placed, self.policy.as_ref());
        // Compute nodes first, so an unplaceable op is reported rather than its inputs.
        let (compute, structural): (Vec<_>, Vec<_>) = placed
            .nodes()
            .iter()
            .partition(|node| !node.op().kind().is_structural());
        for node in compute.into_iter().chain(structural) {
            match node.placement() {
                None => {
                    return Err(BackendError::invalid_placement(
                        node.id(),
                        format!("no member backend accepts `{}`", node.op().kind()),
                    ))
                }
                Some(placement) if self.member(placement).is_none() => {
                    return Err(BackendError::invalid_placement(
                        node.id(),
                        format!("`{placement}` is not a member backend"),
                    ))
                }
                Some(_) => {}
            }
        }

        let partition = partition(&placed)?;
        if self.verify_partitions || env::verify_partitions_enabled() {
            partition.verify(&placed)?;
        }
        debug!(
            "compiling {} ({}) as {} sub-function(s)",
            function.name(),
            function.id(),
            partition.sub_functions.len()
        );
        for sub in &partition.sub_functions {
            self.require_member(&sub.placement)?
                .compile(&sub.function)?;
        }
        Ok(FunctionInstance::new(placed, partition))
    }
}

impl Backend for HybridBackend {
    fn backend_name(&self) -> &str {
        "hybrid"
    }

    fn create_tensor(&self, spec: TensorSpec) -> BackendResult<TensorRef> {
        self.members[0].1.create_tensor(spec)
    }

    fn supports(&self, op: &Operation) -> bool {
        self.members.iter().any(|(_, backend)| backend.supports(op))
    }

    fn compile(&self, function: &Function) -> BackendResult<()> {
        self.compile_instance(function).map(|_| ())
    }

    fn call(
        &self,
        function: &Function,
        outputs: &[TensorRef],
        inputs: &[TensorRef],
    ) -> BackendResult<()> {
        validate_call(function, outputs, inputs)?;
        let instance = self.compile_instance(function)?;
        debug!(
            "calling {} ({}) over {} sub-function(s)",
            function.name(),
            function.id(),
            instance.sub_functions().len()
        );
        engine::execute(
            &instance,
            |placement| self.require_member(placement),
            outputs,
            inputs,
        )
    }
}

impl fmt::Debug for HybridBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridBackend")
            .field("members", &self.placements())
            .field("cache", &self.cache.stats())
            .finish()
    }
}
