/// In-process process group: one thread per rank, synchronised by a barrier
use candle_core::{DType, Tensor};
use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};

use super::{check_broadcast_source, Communicator};

struct Shared {
    world_size: usize,
    barrier: Barrier,
    // `Some(None)` means the source failed its checks
    broadcast_slot: Mutex<Option<Option<HashMap<String, Tensor>>>>,
    // `Some(None)` means a rank failed or the shapes disagreed
    reduce_slot: Mutex<Option<Option<Vec<Vec<f64>>>>>,
    gather_slot: Mutex<Vec<Option<Tensor>>>,
}

/// One rank's handle on a thread-backed group.
///
/// Every rank must call the same collectives in the same order; a rank that
/// skips one deadlocks the others, as with any blocking collective. A rank
/// that fails inside a collective still reaches every barrier of it, and the
/// failure surfaces as an error on all ranks.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

fn poisoned<T>(_: T) -> crate::PretrainError {
    crate::PretrainError::Distributed("local group state poisoned".to_string())
}

fn accumulate(slot: &mut Option<Option<Vec<Vec<f64>>>>, contribution: Option<&Vec<Vec<f64>>>) {
    *slot = match (slot.take(), contribution) {
        (None, Some(host)) => Some(Some(host.clone())),
        (Some(Some(mut acc)), Some(host))
            if acc.len() == host.len() && acc.iter().zip(host).all(|(a, h)| a.len() == h.len()) =>
        {
            for (a, h) in acc.iter_mut().zip(host) {
                for (x, y) in a.iter_mut().zip(h) {
                    *x += y;
                }
            }
            Some(Some(acc))
        }
        _ => Some(None),
    };
}

impl LocalGroup {
    /// Create handles for ranks `0..world_size`
    pub fn new(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(Shared {
            world_size,
            barrier: Barrier::new(world_size),
            broadcast_slot: Mutex::new(None),
            reduce_slot: Mutex::new(None),
            gather_slot: Mutex::new(vec![None; world_size]),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }

    /// Wait on the group barrier, then hand `result` back
    fn sync<T>(&self, result: T) -> T {
        self.shared.barrier.wait();
        result
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn broadcast(
        &self,
        keys: &[&str],
        data: Option<&HashMap<String, Tensor>>,
        dtype: DType,
    ) -> crate::Result<HashMap<String, Tensor>> {
        let mut source_error = None;
        let published = if self.is_source() {
            let checked = match check_broadcast_source(keys, data, dtype) {
                Ok(checked) => Some(checked),
                Err(e) => {
                    source_error = Some(e);
                    None
                }
            };
            self.shared
                .broadcast_slot
                .lock()
                .map(|mut slot| *slot = Some(checked))
                .map_err(poisoned)
        } else {
            Ok(())
        };
        let published = self.sync(published);

        let received = self
            .shared
            .broadcast_slot
            .lock()
            .map(|slot| slot.clone().flatten())
            .map_err(poisoned);
        let received = self.sync(received);

        let reset = if self.is_source() {
            self.shared
                .broadcast_slot
                .lock()
                .map(|mut slot| *slot = None)
                .map_err(poisoned)
        } else {
            Ok(())
        };
        let reset = self.sync(reset);

        if let Some(e) = source_error {
            return Err(e);
        }
        published?;
        reset?;
        let received = received?.ok_or_else(|| {
            crate::PretrainError::Distributed(format!(
                "rank {}: broadcast source failed",
                self.rank
            ))
        })?;

        // Each rank owns its copy
        let mut out = HashMap::with_capacity(received.len());
        for (key, tensor) in received {
            out.insert(key, tensor.copy()?);
        }
        log::debug!("rank {} received broadcast of {:?}", self.rank, keys);
        Ok(out)
    }

    fn all_reduce_mean(&self, values: &[Tensor]) -> crate::Result<Vec<Tensor>> {
        let host = values
            .iter()
            .map(|t| t.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>())
            .collect::<candle_core::Result<Vec<_>>>();

        let deposited = self
            .shared
            .reduce_slot
            .lock()
            .map(|mut slot| accumulate(&mut slot, host.as_ref().ok()))
            .map_err(poisoned);
        let deposited = self.sync(deposited);

        let summed = self
            .shared
            .reduce_slot
            .lock()
            .map(|slot| slot.clone().flatten())
            .map_err(poisoned);
        let summed = self.sync(summed);

        let reset = if self.is_source() {
            self.shared
                .reduce_slot
                .lock()
                .map(|mut slot| *slot = None)
                .map_err(poisoned)
        } else {
            Ok(())
        };
        let reset = self.sync(reset);

        host?;
        deposited?;
        reset?;
        let summed = match summed? {
            Some(summed) if summed.len() == values.len() => summed,
            _ => {
                return Err(crate::PretrainError::Distributed(format!(
                    "rank {}: all-reduce inputs differ in shape across the group or a rank failed",
                    self.rank
                )))
            }
        };

        let world = self.shared.world_size as f64;
        values
            .iter()
            .zip(summed)
            .map(|(t, sums)| {
                let mean: Vec<f64> = sums.into_iter().map(|s| s / world).collect();
                let out = Tensor::from_vec(mean, t.shape(), t.device())?.to_dtype(t.dtype())?;
                Ok(out)
            })
            .collect()
    }

    fn all_gather(&self, tensor: &Tensor) -> crate::Result<Vec<Tensor>> {
        let deposited = self
            .shared
            .gather_slot
            .lock()
            .map(|mut slots| {
                if let Some(slot) = slots.get_mut(self.rank) {
                    *slot = Some(tensor.detach());
                }
            })
            .map_err(poisoned);
        let deposited = self.sync(deposited);

        let gathered = self
            .shared
            .gather_slot
            .lock()
            .map(|slots| slots.clone())
            .map_err(poisoned);
        let gathered = self.sync(gathered);

        let reset = if self.is_source() {
            self.shared
                .gather_slot
                .lock()
                .map(|mut slots| slots.iter_mut().for_each(|slot| *slot = None))
                .map_err(poisoned)
        } else {
            Ok(())
        };
        let reset = self.sync(reset);

        deposited?;
        reset?;
        gathered?
            .into_iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.ok_or_else(|| {
                    crate::PretrainError::Distributed(format!(
                        "rank {} contributed nothing to the all-gather",
                        rank
                    ))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    #[test]
    fn test_broadcast_reaches_every_rank() {
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> crate::Result<Vec<Vec<u32>>> {
                    let device = Device::Cpu;
                    let data = if group.is_source() {
                        let mut data = HashMap::new();
                        data.insert("text".to_string(), Tensor::new(&[[7u32, 8, 9]], &device)?);
                        Some(data)
                    } else {
                        None
                    };
                    let out = group.broadcast(&["text"], data.as_ref(), DType::U32)?;
                    Ok(out["text"].to_vec2::<u32>()?)
                })
            })
            .collect();

        for handle in handles {
            let received = handle.join().expect("rank panicked").expect("broadcast failed");
            assert_eq!(received, vec![vec![7, 8, 9]]);
        }
    }

    #[test]
    fn test_all_reduce_mean() {
        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> crate::Result<(f32, f32)> {
                    let device = Device::Cpu;
                    let value = Tensor::new(2.0f32 + 2.0 * group.rank() as f32, &device)?;
                    let first = group.all_reduce_mean(&[value.clone()])?;
                    // Second round checks the slot was reset
                    let second = group.all_reduce_mean(&[value])?;
                    Ok((first[0].to_scalar::<f32>()?, second[0].to_scalar::<f32>()?))
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().expect("rank panicked").expect("reduce failed");
            assert_eq!(first, 3.0);
            assert_eq!(second, 3.0);
        }
    }

    #[test]
    fn test_mismatched_reduce_fails_on_every_rank() {
        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> crate::Result<bool> {
                    let device = Device::Cpu;
                    let values = if group.is_source() {
                        vec![Tensor::new(1.0f32, &device)?]
                    } else {
                        vec![Tensor::new(&[1.0f32, 2.0], &device)?]
                    };
                    let failed = group.all_reduce_mean(&values).is_err();

                    // The group stays usable afterwards
                    let next = group.all_reduce_mean(&[Tensor::new(4.0f32, &device)?])?;
                    assert_eq!(next[0].to_scalar::<f32>()?, 4.0);
                    Ok(failed)
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().expect("rank panicked").expect("second reduce failed"));
        }
    }

    #[test]
    fn test_source_without_data_fails_every_rank() {
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|group| thread::spawn(move || group.broadcast(&["text"], None, DType::U32).is_err()))
            .collect();

        for handle in handles {
            assert!(handle.join().expect("rank panicked"));
        }
    }

    #[test]
    fn test_all_gather_in_rank_order() {
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> crate::Result<Vec<Vec<u32>>> {
                    let device = Device::Cpu;
                    let rank = group.rank() as u32;
                    let local = Tensor::new(&[[rank * 10, rank * 10 + 1]], &device)?;
                    group
                        .all_gather(&local)?
                        .iter()
                        .map(|t| Ok(t.to_vec2::<u32>()?.concat()))
                        .collect()
                })
            })
            .collect();

        for handle in handles {
            let gathered = handle.join().expect("rank panicked").expect("gather failed");
            assert_eq!(gathered, vec![vec![0, 1], vec![10, 11], vec![20, 21]]);
        }
    }
}
