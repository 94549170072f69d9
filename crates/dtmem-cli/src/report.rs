//! Writes a machine-readable JSON run report alongside the output image.

use serde::Serialize;

use dtmem_core::driver::RunReport;
use dtmem_core::error::Result;

#[derive(Debug, Serialize)]
struct IterationRecord {
    iteration: u32,
    entropy: f32,
    chisq: f32,
    test: f32,
    acc_used: f32,
}

#[derive(Debug, Serialize)]
struct RunReportJson {
    converged: bool,
    iterations: Vec<IterationRecord>,
}

pub fn write_run_report(path: &str, report: &RunReport) -> Result<()> {
    let json = RunReportJson {
        converged: report.converged,
        iterations: report
            .iterations
            .iter()
            .map(|it| IterationRecord {
                iteration: it.iteration,
                entropy: it.entropy,
                chisq: it.chisq,
                test: it.test,
                acc_used: it.acc_used,
            })
            .collect(),
    };
    let text = serde_json::to_string_pretty(&json)
        .map_err(|e| dtmem_core::error::Error::NumericFailure(format!("report serialisation: {e}")))?;
    std::fs::write(path, text)?;
    Ok(())
}
