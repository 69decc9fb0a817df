//! The collective operations the training session relies on.
//!
//! Workers each own a full replica and only communicate through these
//! reductions. Only the single-process group ships here, multi-process
//! backends implement the trait.
use crate::error::Result;
use tch::nn;

pub trait ProcessGroup {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Averages a scalar over all workers.
    fn all_reduce_mean(&self, value: f64) -> Result<f64>;

    /// Averages the gradients of every trainable variable over all workers,
    /// after the backward pass.
    fn average_gradients(&self, vs: &nn::VarStore) -> Result<()>;

    /// Copies the parameters of rank 0 to every worker.
    fn broadcast_parameters(&self, vs: &nn::VarStore) -> Result<()>;

    /// Blocks until every worker reached this point.
    fn barrier(&self) -> Result<()>;

    /// Whether this worker writes checkpoints and experiment files.
    fn is_main(&self) -> bool {
        self.rank() == 0
    }

    /// The seed of this worker's random draws, distinct across ranks.
    fn worker_seed(&self, global_seed: u64) -> u64 {
        global_seed + self.rank() as u64
    }
}

/// A group with a single worker, every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn average_gradients(&self, _vs: &nn::VarStore) -> Result<()> {
        Ok(())
    }

    fn broadcast_parameters(&self, _vs: &nn::VarStore) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Worker(usize);

    impl ProcessGroup for Worker {
        fn rank(&self) -> usize {
            self.0
        }

        fn world_size(&self) -> usize {
            4
        }

        fn all_reduce_mean(&self, value: f64) -> Result<f64> {
            Ok(value)
        }

        fn average_gradients(&self, _vs: &nn::VarStore) -> Result<()> {
            Ok(())
        }

        fn broadcast_parameters(&self, _vs: &nn::VarStore) -> Result<()> {
            Ok(())
        }

        fn barrier(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn single_process_is_main() -> Result<()> {
        let group = SingleProcess;
        assert!(group.is_main());
        assert_eq!(group.world_size(), 1);
        assert_eq!(group.worker_seed(3407), 3407);
        assert_eq!(group.all_reduce_mean(0.25)?, 0.25);
        group.barrier()
    }

    #[test]
    fn worker_seed_offsets_by_rank() {
        assert!(!Worker(2).is_main());
        assert_eq!(Worker(2).worker_seed(3407), 3409);
        assert_eq!(Worker(3).worker_seed(0), 3);
    }
}
