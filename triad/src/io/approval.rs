//! Human plan approval for guided runs.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDecision {
    Approve,
    Reject,
}

pub trait PlanApprover {
    fn present_plan(&mut self, steps: &[String]) -> Result<PlanDecision>;
}

/// Prints the plan and reads a y/N answer. Anything but yes rejects.
pub struct TerminalApprover<R, W> {
    input: R,
    output: W,
}

impl TerminalApprover<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> TerminalApprover<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> PlanApprover for TerminalApprover<R, W> {
    fn present_plan(&mut self, steps: &[String]) -> Result<PlanDecision> {
        writeln!(self.output, "Proposed plan:")?;
        for (i, step) in steps.iter().enumerate() {
            writeln!(self.output, "  {}. {}", i + 1, step)?;
        }
        write!(self.output, "Approve this plan? [y/N] ")?;
        self.output.flush()?;

        let mut answer = String::new();
        self.input
            .read_line(&mut answer)
            .context("read plan approval")?;
        let decision = if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            PlanDecision::Approve
        } else {
            PlanDecision::Reject
        };
        Ok(decision)
    }
}
