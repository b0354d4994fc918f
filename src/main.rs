use std::{env, num::NonZeroUsize, sync::Arc};

use anyhow::{Context, bail};
use log::info;
use ndarray::{Array1, Array2};

use pipeline_orchestra::{
    Dense, Partition, Pipeline, PipelineConfig, orchestra::bubble_fraction,
    parallel::TensorParallelStage,
};

const MICROBATCHES: usize = 8;
const ROWS: usize = 4;
const SIZES: [usize; 4] = [8, 12, 16, 4];
const TP_WORLD_SIZE: usize = 4;
const TOLERANCE: f32 = 1e-4;

fn weights(rows: usize, cols: usize, seed: f32) -> (Array2<f32>, Array1<f32>) {
    let weight = Array2::from_shape_fn((rows, cols), |(r, c)| {
        ((r * cols + c) as f32 * 0.37 + seed).sin() * 0.5
    });
    let bias = Array1::from_shape_fn(cols, |c| (c as f32 + seed).cos() * 0.1);
    (weight, bias)
}

fn partitions() -> anyhow::Result<Vec<Arc<dyn Partition<Array2<f32>>>>> {
    let (w0, b0) = weights(SIZES[0], SIZES[1], 0.);
    let (w1, b1) = weights(SIZES[1], SIZES[2], 1.);
    let (w2, b2) = weights(SIZES[2], SIZES[3], 2.);

    let tp = TensorParallelStage::column("tp", TP_WORLD_SIZE, w1.view(), b1.view())?;

    Ok(vec![
        Arc::new(Dense::new(w0, b0)?),
        Arc::new(tp),
        Arc::new(Dense::new(w2, b2)?.with_sigmoid(1.)),
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => {
            PipelineConfig::from_path(&path).with_context(|| format!("loading config {path}"))?
        }
        None => PipelineConfig::default(),
    };

    let partitions = partitions()?;
    let microbatches: Vec<_> = (0..MICROBATCHES)
        .map(|i| Array2::from_shape_fn((ROWS, SIZES[0]), |(r, c)| (i + r) as f32 - c as f32 * 0.5))
        .collect();

    let expected = microbatches
        .iter()
        .map(|x| {
            partitions
                .iter()
                .try_fold(x.clone(), |x, partition| partition.apply(x))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("sequential reference failed: {e}"))?;

    let pipeline = Pipeline::new(partitions).with_config(config);
    let (outputs, stats) = pipeline.run_with_stats(microbatches).await?;

    for (i, (got, want)) in outputs.iter().zip(&expected).enumerate() {
        let diff = got
            .iter()
            .zip(want)
            .map(|(a, b)| (a - b).abs())
            .fold(0., f32::max);

        if diff > TOLERANCE {
            bail!("microbatch {i} differs from the sequential reference by {diff}");
        }
    }

    info!(
        cycles = stats.cycles,
        tasks = stats.tasks;
        "outputs match the sequential reference, finished in {}ms",
        stats.elapsed.as_millis()
    );

    for (worker_id, utilization) in stats.utilization().unwrap_or_default().iter().enumerate() {
        info!(worker_id = worker_id; "busy {:.1}% of the run", utilization * 100.);
    }

    if let (Some(m), Some(n)) = (
        NonZeroUsize::new(MICROBATCHES),
        NonZeroUsize::new(pipeline.partitions()),
    ) {
        info!("ideal bubble fraction of the schedule: {:.3}", bubble_fraction(m, n));
    }

    Ok(())
}
