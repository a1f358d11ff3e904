//! The example suite driven by `dfe-client`
//!
//! Builds the inputs for each example, runs its session and checks the
//! output against the CPU reference.

use crate::check::{self, CheckReport};
use crate::client::DfeClient;
use crate::error::Result;
use crate::protocol::AcceleratorImage;
use crate::session::{self, StageTimings};
use rand::prelude::*;
use serde::Serialize;
use std::fmt;

/// Array length used when none is given
pub const DEFAULT_SIZE: usize = 384;

/// Scalar added by the vector addition example
pub const VECTOR_SCALAR: i32 = 3;

/// Mismatches kept in a report
const MAX_REPORTED: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Example {
    #[serde(rename = "lmem_loopback")]
    LMemLoopback,
    PassThrough,
    Simple,
    MovingAverage,
    VectorAddition,
}

impl Example {
    pub const ALL: [Example; 5] = [
        Example::LMemLoopback,
        Example::PassThrough,
        Example::Simple,
        Example::MovingAverage,
        Example::VectorAddition,
    ];

    pub fn image(self) -> AcceleratorImage {
        match self {
            Self::LMemLoopback => AcceleratorImage::LMemLoopback,
            Self::PassThrough => AcceleratorImage::PassThrough,
            Self::Simple => AcceleratorImage::Simple,
            Self::MovingAverage => AcceleratorImage::MovingAverage,
            Self::VectorAddition => AcceleratorImage::VectorAddition,
        }
    }
}

impl fmt::Display for Example {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.image().name())
    }
}

/// Checked outcome of one example run
#[derive(Clone, Debug, Serialize)]
pub struct ExampleReport {
    pub example: Example,
    pub size: usize,
    pub checked: usize,
    pub failures: usize,
    /// Leading mismatches, rendered for display
    pub mismatches: Vec<String>,
    pub timings: StageTimings,
}

impl ExampleReport {
    pub fn passed(&self) -> bool {
        self.failures == 0
    }

    fn new<T: fmt::Display>(
        example: Example,
        size: usize,
        check: CheckReport<T>,
        timings: StageTimings,
    ) -> Self {
        let mut mismatches: Vec<String> = check
            .mismatches
            .iter()
            .take(MAX_REPORTED)
            .map(|m| m.to_string())
            .collect();
        if let Some((actual, expected)) = check.length_mismatch {
            mismatches.push(format!("Output length {} (expected {})", actual, expected));
        }

        Self {
            example,
            size,
            checked: check.checked,
            failures: check.failures(),
            mismatches,
            timings,
        }
    }
}

/// Run one example on `size` elements and check its output
///
/// Random inputs are drawn from `rng`.
pub async fn run_example<R: Rng>(
    client: &DfeClient,
    example: Example,
    size: usize,
    rng: &mut R,
) -> Result<ExampleReport> {
    tracing::info!("Running {} with {} elements", example, size);

    let report = match example {
        Example::LMemLoopback => {
            let a: Vec<i32> = (0..size).map(|i| i as i32).collect();
            let b: Vec<i32> = (0..size).map(|i| (size - i) as i32).collect();
            let result = session::lmem_loopback(client, &a, &b).await?;
            let expected = check::lmem_loopback_cpu(&a, &b);
            ExampleReport::new(
                example,
                size,
                check::compare(&result.output, &expected),
                result.timings,
            )
        }
        Example::PassThrough => {
            let data: Vec<f32> = (1..=size).map(|i| i as f32).collect();
            let result = session::pass_through(client, &data).await?;
            let expected = check::pass_through_cpu(&data);
            ExampleReport::new(
                example,
                size,
                check::compare(&result.output, &expected),
                result.timings,
            )
        }
        Example::Simple => {
            let x: Vec<f32> = (1..=size).map(|i| i as f32).collect();
            let result = session::simple(client, &x).await?;
            let expected = check::simple_cpu(&x);
            ExampleReport::new(
                example,
                size,
                check::compare(&result.output, &expected),
                result.timings,
            )
        }
        Example::MovingAverage => {
            let data: Vec<f32> = (0..size).map(|_| rng.gen_range(0..=1000) as f32).collect();
            let result = session::moving_average(client, &data).await?;
            let expected = check::moving_average_cpu(&data);
            // Edge values are not checked
            let interior = 1..size.saturating_sub(1);
            ExampleReport::new(
                example,
                size,
                check::compare_range(&result.output, &expected, interior),
                result.timings,
            )
        }
        Example::VectorAddition => {
            let x: Vec<i32> = (0..size).map(|_| rng.gen_range(0..100)).collect();
            let y: Vec<i32> = (0..size).map(|_| rng.gen_range(0..100)).collect();
            let result = session::vector_addition(client, &x, &y, VECTOR_SCALAR).await?;
            let expected = check::vector_addition_cpu(&x, &y, VECTOR_SCALAR);
            ExampleReport::new(
                example,
                size,
                check::compare(&result.output, &expected),
                result.timings,
            )
        }
    };

    if report.passed() {
        tracing::info!("{} passed ({} values checked)", example, report.checked);
    } else {
        tracing::warn!("{} failed {} times", example, report.failures);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::server::{DfeServer, ServerConfig};
    use crate::transport::LocalTransport;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_all_examples_pass() {
        let server = Arc::new(DfeServer::new(ServerConfig {
            memory_pool_size: 4 * 1024 * 1024,
            lmem_size: 64 * 1024,
            ..Default::default()
        }));
        let transport = Arc::new(LocalTransport::new(Arc::clone(&server)));
        let client = DfeClient::with_transport(ClientConfig::default(), transport);
        let mut rng = StdRng::seed_from_u64(7);

        for example in Example::ALL {
            let report = run_example(&client, example, DEFAULT_SIZE, &mut rng)
                .await
                .unwrap();
            assert!(report.passed(), "{}: {:?}", example, report.mismatches);
            assert!(!report.timings.is_empty());
        }
        assert_eq!(server.stats().live_objects(), 0);
    }

    #[test]
    fn test_report_renders_mismatches() {
        let expected: Vec<i32> = (0..50).collect();
        let actual = vec![0i32; 40];
        let report = ExampleReport::new(
            Example::LMemLoopback,
            50,
            check::compare(&actual, &expected),
            StageTimings::default(),
        );

        assert!(!report.passed());
        assert_eq!(report.failures, 40);
        assert_eq!(report.mismatches.len(), MAX_REPORTED + 1);
        assert_eq!(report.mismatches[0], "Output data @ 1 = 0 (expected 1)");
        assert_eq!(report.mismatches[MAX_REPORTED], "Output length 40 (expected 50)");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["example"], "lmem_loopback");
    }
}
