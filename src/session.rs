//! End-to-end accelerator sessions
//!
//! Each function drives one example through its fixed series of remote
//! calls and returns the output with the time spent in every stage. Input
//! lengths are checked before the first remote call. Whatever happens, the
//! remote objects a session acquired are released before it returns.

use crate::client::{DfeClient, RemoteBuffer};
use crate::error::{DfeError, Result};
use crate::protocol::{AcceleratorImage, ActionDescriptor, ComputeAction, Element};
use crate::scope::RemoteScope;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::time::{Duration, Instant};

/// A timed step of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    InitImage,
    LoadEngine,
    SendInput,
    AllocateOutput,
    WriteLMem,
    Compute,
    ReadLMem,
    Unload,
    ReceiveOutput,
    FreeBuffers,
    ReleaseImage,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Self::InitImage => "Initializing image",
            Self::LoadEngine => "Loading DFE",
            Self::SendInput => "Sending input data",
            Self::AllocateOutput => "Allocating memory for output on server",
            Self::WriteLMem => "Writing to LMem",
            Self::Compute => "Running on DFE",
            Self::ReadLMem => "Reading from LMem",
            Self::Unload => "Unloading DFE",
            Self::ReceiveOutput => "Getting output data",
            Self::FreeBuffers => "Freeing allocated memory on server",
            Self::ReleaseImage => "Releasing image",
        }
    }
}

/// Elapsed time of one stage
#[derive(Clone, Debug, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    #[serde(rename = "seconds", serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
}

fn as_secs_f64<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// Stage timings in the order the stages ran
#[derive(Clone, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct StageTimings {
    stages: Vec<StageTiming>,
}

impl StageTimings {
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        tracing::debug!("{}: {:?}", stage.label(), elapsed);
        self.stages.push(StageTiming { stage, elapsed });
    }

    /// Await `fut` and record how long it took
    pub async fn measure<T>(&mut self, stage: Stage, fut: impl Future<Output = T>) -> T {
        let start = Instant::now();
        let out = fut.await;
        self.record(stage, start.elapsed());
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageTiming> {
        self.stages.iter()
    }

    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.stages
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.elapsed)
    }

    pub fn total(&self) -> Duration {
        self.stages.iter().map(|t| t.elapsed).sum()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Output array of a session plus its timings
#[derive(Clone, Debug)]
pub struct SessionOutput<T> {
    pub output: Vec<T>,
    pub timings: StageTimings,
}

fn ensure_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(DfeError::LengthMismatch { expected, got });
    }
    Ok(())
}

/// Release what the scope still holds and pair the output with its timings
async fn settle<T>(
    scope: RemoteScope<'_>,
    timings: StageTimings,
    outcome: Result<Vec<T>>,
) -> Result<SessionOutput<T>> {
    let output = scope.finish(outcome).await?;
    Ok(SessionOutput { output, timings })
}

fn write_lmem<T: Element>(address: u64, source: &RemoteBuffer<T>) -> ActionDescriptor {
    ActionDescriptor::WriteLMem {
        address,
        nbytes: source.byte_len(),
        source: source.handle(),
    }
}

/// LMem loopback: `out = a + b` staged through the engine's LMem
///
/// `a` is written at byte 0, `b` at `4N`, and the sum is read back from
/// `8N`. The engine is unloaded before the output is downloaded.
pub async fn lmem_loopback(
    client: &DfeClient,
    a: &[i32],
    b: &[i32],
) -> Result<SessionOutput<i32>> {
    ensure_len(a.len(), b.len())?;

    let mut scope = RemoteScope::new(client);
    let mut timings = StageTimings::default();
    let outcome = lmem_loopback_steps(&mut scope, &mut timings, a, b).await;
    settle(scope, timings, outcome).await
}

async fn lmem_loopback_steps(
    scope: &mut RemoteScope<'_>,
    timings: &mut StageTimings,
    a: &[i32],
    b: &[i32],
) -> Result<Vec<i32>> {
    let n = a.len();

    let image = timings
        .measure(Stage::InitImage, scope.init(AcceleratorImage::LMemLoopback))
        .await?;
    let engine = timings.measure(Stage::LoadEngine, scope.load(&image)).await?;

    let (in_a, in_b) = timings
        .measure(Stage::SendInput, async {
            let in_a = scope.upload(a).await?;
            let in_b = scope.upload(b).await?;
            Ok::<_, DfeError>((in_a, in_b))
        })
        .await?;
    let out = timings
        .measure(Stage::AllocateOutput, scope.allocate::<i32>(n))
        .await?;
    let size_bytes = out.byte_len();

    timings
        .measure(Stage::WriteLMem, async {
            scope.run(&engine, write_lmem(0, &in_a)).await?;
            scope.run(&engine, write_lmem(size_bytes, &in_b)).await
        })
        .await?;

    let compute = ComputeAction::new().set_param("N", n as u64);
    timings
        .measure(
            Stage::Compute,
            scope.run(&engine, ActionDescriptor::Compute(compute)),
        )
        .await?;

    let read_back = ActionDescriptor::ReadLMem {
        address: 2 * size_bytes,
        nbytes: size_bytes,
        destination: out.handle(),
    };
    timings
        .measure(Stage::ReadLMem, scope.run(&engine, read_back))
        .await?;

    timings.measure(Stage::Unload, scope.unload(engine)).await?;

    let output = timings
        .measure(Stage::ReceiveOutput, scope.client().read_array(&out, n))
        .await?;

    timings
        .measure(Stage::FreeBuffers, async {
            scope.free(in_a).await?;
            scope.free(in_b).await?;
            scope.free(out).await
        })
        .await?;
    timings
        .measure(Stage::ReleaseImage, scope.release_image(image))
        .await?;

    Ok(output)
}

/// Pass-through: the output is a copy of the input
pub async fn pass_through(client: &DfeClient, data: &[f32]) -> Result<SessionOutput<f32>> {
    basic_static(client, AcceleratorImage::PassThrough, data).await
}

/// Moving average through the single-call compute path
pub async fn moving_average(client: &DfeClient, data: &[f32]) -> Result<SessionOutput<f32>> {
    basic_static(client, AcceleratorImage::MovingAverage, data).await
}

async fn basic_static(
    client: &DfeClient,
    image: AcceleratorImage,
    data: &[f32],
) -> Result<SessionOutput<f32>> {
    let mut scope = RemoteScope::new(client);
    let mut timings = StageTimings::default();
    let outcome = basic_static_steps(&mut scope, &mut timings, image, data).await;
    settle(scope, timings, outcome).await
}

async fn basic_static_steps(
    scope: &mut RemoteScope<'_>,
    timings: &mut StageTimings,
    image: AcceleratorImage,
    data: &[f32],
) -> Result<Vec<f32>> {
    let n = data.len();

    let input = timings.measure(Stage::SendInput, scope.upload(data)).await?;
    let output = timings
        .measure(Stage::AllocateOutput, scope.allocate::<f32>(n))
        .await?;

    timings
        .measure(
            Stage::Compute,
            scope.client().compute(image, n, &input, &output),
        )
        .await?;

    let result = timings
        .measure(Stage::ReceiveOutput, scope.client().read_array(&output, n))
        .await?;

    timings
        .measure(Stage::FreeBuffers, async {
            scope.free(input).await?;
            scope.free(output).await
        })
        .await?;

    Ok(result)
}

/// Simple: `y = x * x + x` through a dynamically built compute action
pub async fn simple(client: &DfeClient, x: &[f32]) -> Result<SessionOutput<f32>> {
    let mut scope = RemoteScope::new(client);
    let mut timings = StageTimings::default();
    let outcome = simple_steps(&mut scope, &mut timings, x).await;
    settle(scope, timings, outcome).await
}

async fn simple_steps(
    scope: &mut RemoteScope<'_>,
    timings: &mut StageTimings,
    x: &[f32],
) -> Result<Vec<f32>> {
    let n = x.len();

    let image = timings
        .measure(Stage::InitImage, scope.init(AcceleratorImage::Simple))
        .await?;
    let engine = timings.measure(Stage::LoadEngine, scope.load(&image)).await?;

    let input = timings.measure(Stage::SendInput, scope.upload(x)).await?;
    let output = timings
        .measure(Stage::AllocateOutput, scope.allocate::<f32>(n))
        .await?;

    let compute = ComputeAction::new()
        .set_param("N", n as u64)
        .queue_input("x", input.handle(), input.byte_len())
        .queue_output("y", output.handle(), output.byte_len());
    timings
        .measure(
            Stage::Compute,
            scope.run(&engine, ActionDescriptor::Compute(compute)),
        )
        .await?;

    timings.measure(Stage::Unload, scope.unload(engine)).await?;

    let result = timings
        .measure(Stage::ReceiveOutput, scope.client().read_array(&output, n))
        .await?;

    timings
        .measure(Stage::FreeBuffers, async {
            scope.free(input).await?;
            scope.free(output).await
        })
        .await?;
    timings
        .measure(Stage::ReleaseImage, scope.release_image(image))
        .await?;

    Ok(result)
}

/// Vector addition: `s = x + y + scalar`
///
/// `x` is staged in LMem, `y` is streamed in and `s` streamed out.
pub async fn vector_addition(
    client: &DfeClient,
    x: &[i32],
    y: &[i32],
    scalar: i32,
) -> Result<SessionOutput<i32>> {
    ensure_len(x.len(), y.len())?;

    let mut scope = RemoteScope::new(client);
    let mut timings = StageTimings::default();
    let outcome = vector_addition_steps(&mut scope, &mut timings, x, y, scalar).await;
    settle(scope, timings, outcome).await
}

async fn vector_addition_steps(
    scope: &mut RemoteScope<'_>,
    timings: &mut StageTimings,
    x: &[i32],
    y: &[i32],
    scalar: i32,
) -> Result<Vec<i32>> {
    let n = x.len();

    let image = timings
        .measure(Stage::InitImage, scope.init(AcceleratorImage::VectorAddition))
        .await?;
    let engine = timings.measure(Stage::LoadEngine, scope.load(&image)).await?;

    let (in_x, in_y) = timings
        .measure(Stage::SendInput, async {
            let in_x = scope.upload(x).await?;
            let in_y = scope.upload(y).await?;
            Ok::<_, DfeError>((in_x, in_y))
        })
        .await?;
    let out = timings
        .measure(Stage::AllocateOutput, scope.allocate::<i32>(n))
        .await?;

    timings
        .measure(Stage::WriteLMem, scope.run(&engine, write_lmem(0, &in_x)))
        .await?;

    // Scalars travel as their 32-bit pattern
    let compute = ComputeAction::new()
        .set_param("A", u64::from(scalar as u32))
        .set_param("N", n as u64)
        .queue_input("y", in_y.handle(), in_y.byte_len())
        .queue_output("s", out.handle(), out.byte_len());
    timings
        .measure(
            Stage::Compute,
            scope.run(&engine, ActionDescriptor::Compute(compute)),
        )
        .await?;

    timings.measure(Stage::Unload, scope.unload(engine)).await?;

    let output = timings
        .measure(Stage::ReceiveOutput, scope.client().read_array(&out, n))
        .await?;

    timings
        .measure(Stage::FreeBuffers, async {
            scope.free(in_x).await?;
            scope.free(in_y).await?;
            scope.free(out).await
        })
        .await?;
    timings
        .measure(Stage::ReleaseImage, scope.release_image(image))
        .await?;

    Ok(output)
}
