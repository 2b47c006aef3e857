//! Collective communication used by the training step
//!
//! The step only needs two collectives: broadcasting the raw batch inside the
//! tensor-parallel group and averaging the reported loss across the
//! data-parallel group. Both block the caller until every rank of the group
//! has joined.

pub mod local;

pub use local::LocalGroup;

use candle_core::{DType, Tensor};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SequenceParallelMode;

/// A process group able to run the step's blocking collectives.
///
/// Rank 0 of the group is the broadcast source.
pub trait Communicator: Send + Sync {
    /// Rank of this process within the group
    fn rank(&self) -> usize;

    /// Number of processes in the group
    fn world_size(&self) -> usize;

    /// Deliver the source's tensors for `keys` to every rank.
    ///
    /// Only the source reads `data`; every other rank may pass `None`. The
    /// source fails with `Precondition` when a key is missing and with
    /// `Distributed` when a tensor is not of `dtype`.
    fn broadcast(
        &self,
        keys: &[&str],
        data: Option<&HashMap<String, Tensor>>,
        dtype: DType,
    ) -> crate::Result<HashMap<String, Tensor>>;

    /// Element-wise mean of `values` across the group
    fn all_reduce_mean(&self, values: &[Tensor]) -> crate::Result<Vec<Tensor>>;

    /// Every rank's `tensor`, detached, in rank order
    fn all_gather(&self, tensor: &Tensor) -> crate::Result<Vec<Tensor>>;

    /// Whether this rank is the broadcast source
    fn is_source(&self) -> bool {
        self.rank() == 0
    }
}

/// Check that the source holds every key with the expected dtype
pub(crate) fn check_broadcast_source(
    keys: &[&str],
    data: Option<&HashMap<String, Tensor>>,
    dtype: DType,
) -> crate::Result<HashMap<String, Tensor>> {
    let data = data.ok_or_else(|| {
        crate::PretrainError::Precondition("broadcast source has no data".to_string())
    })?;

    let mut out = HashMap::with_capacity(keys.len());
    for &key in keys {
        let tensor = data.get(key).ok_or_else(|| {
            crate::PretrainError::Precondition(format!("broadcast source is missing key '{key}'"))
        })?;
        if tensor.dtype() != dtype {
            return Err(crate::PretrainError::Distributed(format!(
                "{key} has data type {:?} which is different than {:?}",
                tensor.dtype(),
                dtype
            )));
        }
        out.insert(key.to_string(), tensor.clone());
    }
    Ok(out)
}

/// Group of one: broadcast hands back the local data, all-reduce is identity
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(
        &self,
        keys: &[&str],
        data: Option<&HashMap<String, Tensor>>,
        dtype: DType,
    ) -> crate::Result<HashMap<String, Tensor>> {
        check_broadcast_source(keys, data, dtype)
    }

    fn all_reduce_mean(&self, values: &[Tensor]) -> crate::Result<Vec<Tensor>> {
        Ok(values.to_vec())
    }

    fn all_gather(&self, tensor: &Tensor) -> crate::Result<Vec<Tensor>> {
        Ok(vec![tensor.detach()])
    }
}

/// Concatenate every rank's `local` along `dim` in rank order.
///
/// Only this rank's own slice stays attached to the autograd graph, so the
/// gradient of a loss over the gathered tensor reaches the local slice alone.
pub fn gather_along(group: &dyn Communicator, local: &Tensor, dim: usize) -> crate::Result<Tensor> {
    let mut parts = group.all_gather(local)?;
    match parts.get_mut(group.rank()) {
        Some(own) => *own = local.clone(),
        None => {
            return Err(crate::PretrainError::Distributed(format!(
                "all-gather returned {} parts for rank {}",
                parts.len(),
                group.rank()
            )))
        }
    }
    Ok(Tensor::cat(&parts, dim)?)
}

/// The groups this rank belongs to
#[derive(Clone)]
pub struct ProcessGroups {
    /// Tensor-parallel group; the raw batch is broadcast inside it
    pub tensor_parallel: Arc<dyn Communicator>,
    /// Dedicated sequence-parallel group
    pub sequence_parallel: Arc<dyn Communicator>,
    /// Data-parallel group; reported losses are averaged over it
    pub data_parallel: Arc<dyn Communicator>,
}

impl ProcessGroups {
    /// Every group is this process alone
    pub fn single() -> Self {
        Self {
            tensor_parallel: Arc::new(SingleProcess),
            sequence_parallel: Arc::new(SingleProcess),
            data_parallel: Arc::new(SingleProcess),
        }
    }

    /// `(world_size, rank)` used to slice the sequence axis
    pub fn sequence_parallel_topology(&self, mode: SequenceParallelMode) -> (usize, usize) {
        match mode {
            SequenceParallelMode::Disabled => (1, 0),
            SequenceParallelMode::TensorParallel => (
                self.tensor_parallel.world_size(),
                self.tensor_parallel.rank(),
            ),
            SequenceParallelMode::Dedicated => (
                self.sequence_parallel.world_size(),
                self.sequence_parallel.rank(),
            ),
        }
    }
}

impl Default for ProcessGroups {
    fn default() -> Self {
        Self::single()
    }
}

impl std::fmt::Debug for ProcessGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroups")
            .field(
                "tensor_parallel",
                &(self.tensor_parallel.rank(), self.tensor_parallel.world_size()),
            )
            .field(
                "sequence_parallel",
                &(self.sequence_parallel.rank(), self.sequence_parallel.world_size()),
            )
            .field(
                "data_parallel",
                &(self.data_parallel.rank(), self.data_parallel.world_size()),
            )
            .finish()
    }
}
