// file: src/stages/report.rs
// version: 1.1.0
// guid: cb27cb8a-b60f-4208-a627-5c78c01f43a2

use super::{StageOutput, StagePreview};
use crate::context::OrchestratorContext;
use crate::reporter::ReportGenerator;
use crate::Result;

pub async fn is_satisfied(ctx: &OrchestratorContext) -> Result<bool> {
    ReportGenerator::new(ctx).is_current().await
}

pub async fn apply(ctx: &OrchestratorContext) -> Result<StageOutput> {
    let generator = ReportGenerator::new(ctx);
    let report = generator.collect().await?;
    let path = generator.write(&report).await?;
    Ok(StageOutput::verified(format!("report at {}", path.display())))
}

pub fn preview(ctx: &OrchestratorContext) -> StagePreview {
    StagePreview::default().file(ReportGenerator::new(ctx).path())
}
