// ========================================================================================
//
//                                 THE ENGINE FACADE
//
// ========================================================================================
//
// The one front door. An `Engine` owns a backing store and its container
// arena. Every public operation (import, persistence, aggregation,
// regression, sizing) is a method here that validates arguments eagerly and
// then delegates to the planner, executor, and accumulators. Malformed
// requests never touch storage.

use crate::aggregate::{Accumulator, AggregateError, Statistic, compute};
use crate::container::{Container, ContainerArena, ContainerError};
use crate::executor::{ExecuteOptions, execute};
use crate::io::{self, IoError, TextFormat};
use crate::planner::{PlanError, plan};
use crate::regress::{LinearFit, LinearFitAccumulator};
use crate::store::{BackingStore, FileStore, MemoryStore, StoreError};
use crate::types::{DType, Partition, Shape};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns shared resources and exposes the public operations.
pub struct Engine {
    arena: Arc<ContainerArena>,
    options: ExecuteOptions,
}

impl Engine {
    /// An engine over heap-backed storage. The usual choice for tests and
    /// datasets that fit comfortably in memory.
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// An engine spooling each backing region to a file under `dir`.
    pub fn spooled(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        Ok(Self::with_store(Arc::new(FileStore::open(dir.into())?)))
    }

    pub fn with_store(store: Arc<dyn BackingStore>) -> Self {
        Self {
            arena: ContainerArena::new(store),
            options: ExecuteOptions::default(),
        }
    }

    /// Replaces the per-pass execution options (worker count, cancellation,
    /// progress label) used by every reduction this engine runs.
    pub fn set_options(&mut self, options: ExecuteOptions) {
        self.options = options;
    }

    pub fn arena(&self) -> &Arc<ContainerArena> {
        &self.arena
    }

    /// Allocates a fresh zero-filled container.
    pub fn create(&self, shape: Shape, dtype: DType) -> Result<Container, EngineError> {
        Ok(Container::create(&self.arena, shape, dtype)?)
    }

    /// Imports a delimited text file.
    pub fn open(
        &self,
        path: &Path,
        format: TextFormat,
        dtype: DType,
    ) -> Result<Container, EngineError> {
        Ok(io::open(&self.arena, path, format, dtype)?)
    }

    /// Persists a container; returns the manifest location `load` accepts.
    pub fn save(&self, container: &Container, location: &Path) -> Result<PathBuf, EngineError> {
        Ok(io::save(container, location)?)
    }

    /// Restores a container saved by [`Engine::save`].
    pub fn load(&self, location: &Path) -> Result<Container, EngineError> {
        Ok(io::load(&self.arena, location)?)
    }

    /// Resolves a column selection against a container shape.
    fn column_selection(
        container: &Container,
        column: usize,
    ) -> Result<Vec<usize>, EngineError> {
        match container.shape() {
            Shape::Vector { .. } => {
                if column != 0 {
                    return Err(EngineError::InvalidArgument(format!(
                        "vector containers only have column 0, got {column}"
                    )));
                }
                Ok(Vec::new())
            }
            Shape::Matrix { cols, .. } => {
                if column >= cols {
                    return Err(EngineError::InvalidArgument(format!(
                        "column {column} out of bounds for {cols} columns"
                    )));
                }
                Ok(vec![column])
            }
        }
    }

    /// Computes one statistic over a column, chunked per `partition`. The
    /// result is independent of the partition choice (within float tolerance).
    pub fn aggregate(
        &self,
        container: &Container,
        column: usize,
        statistic: Statistic,
        partition: Partition,
    ) -> Result<f64, EngineError> {
        if let Statistic::MedianApprox { bins } = statistic {
            if bins < 1 {
                return Err(EngineError::InvalidArgument(
                    "approximate median needs at least one bin".to_string(),
                ));
            }
        }
        let columns = Self::column_selection(container, column)?;
        let ranges = plan(container.shape().chunk_axis_len(), partition)?;
        Ok(compute(container, &ranges, &columns, statistic, &self.options)?)
    }

    /// Fits Y = Xβ + ε over the selected columns without materializing the
    /// design matrix. Coefficients come back intercept first.
    pub fn fit_linear_model(
        &self,
        container: &Container,
        response: usize,
        predictors: &[usize],
        partition: Partition,
        ridge: f64,
    ) -> Result<LinearFit, EngineError> {
        let cols = match container.shape() {
            Shape::Matrix { cols, .. } => cols,
            Shape::Vector { .. } => {
                return Err(EngineError::InvalidArgument(
                    "fitting needs a matrix container".to_string(),
                ));
            }
        };
        for &c in predictors.iter().chain(std::iter::once(&response)) {
            if c >= cols {
                return Err(EngineError::InvalidArgument(format!(
                    "column {c} out of bounds for {cols} columns"
                )));
            }
        }
        if predictors.contains(&response) {
            return Err(EngineError::InvalidArgument(format!(
                "response column {response} also appears among the predictors"
            )));
        }
        if !(ridge >= 0.0) {
            return Err(EngineError::InvalidArgument(format!(
                "ridge must be non-negative and finite, got {ridge}"
            )));
        }

        let mut columns: Vec<usize> = predictors.to_vec();
        columns.push(response);
        let ranges = plan(container.shape().chunk_axis_len(), partition)?;

        let acc = LinearFitAccumulator::new(predictors.len(), ridge);
        let state = execute(container, &ranges, &columns, &acc, &self.options)
            .map_err(AggregateError::from)?;
        Ok(acc.finalize(state).map_err(AggregateError::from)?)
    }
}

// Sizing and residency are free functions on purpose: they span containers
// from any engine and read process-wide state.
pub use crate::container::size_of;
pub use crate::executor::resident_memory;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AccumulatorError;
    use crate::types::ChunkRange;

    fn matrix_engine(rows: &[Vec<f64>]) -> (Engine, Container) {
        let engine = Engine::in_memory();
        let cols = rows[0].len();
        let c = engine
            .create(
                Shape::Matrix {
                    rows: rows.len(),
                    cols,
                },
                DType::F64,
            )
            .unwrap();
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        c.write_chunk(ChunkRange::new(0, rows.len()), &flat).unwrap();
        (engine, c)
    }

    #[test]
    fn aggregate_validates_the_column_before_touching_storage() {
        let (engine, c) = matrix_engine(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert!(matches!(
            engine.aggregate(&c, 5, Statistic::Mean, Partition::ByCount(1)),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn fit_recovers_a_plane_through_the_facade() {
        let rows: Vec<Vec<f64>> = (0..60)
            .map(|i| {
                let x1 = i as f64 * 0.1;
                let x2 = (i % 7) as f64;
                vec![x1, x2, 1.0 + 2.0 * x1 - 0.5 * x2]
            })
            .collect();
        let (engine, c) = matrix_engine(&rows);

        let fit = engine
            .fit_linear_model(&c, 2, &[0, 1], Partition::ByCount(5), 0.0)
            .unwrap();
        let expected = [1.0, 2.0, -0.5];
        for (got, want) in fit.coefficients.iter().zip(expected) {
            assert!((got - want).abs() < 1e-8, "{got} vs {want}");
        }
        assert!(fit.rss < 1e-9);
    }

    #[test]
    fn fit_rejects_a_response_listed_as_predictor() {
        let (engine, c) = matrix_engine(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert!(matches!(
            engine.fit_linear_model(&c, 1, &[0, 1], Partition::ByCount(1), 0.0),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_container_mean_is_an_error_not_a_default() {
        let engine = Engine::in_memory();
        let c = engine
            .create(Shape::Vector { len: 0 }, DType::F64)
            .unwrap();
        let err = engine
            .aggregate(&c, 0, Statistic::Mean, Partition::ByCount(3))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Aggregate(AggregateError::Accumulator(AccumulatorError::EmptyInput))
        ));
    }
}
