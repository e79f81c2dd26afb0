//! Render-only backend: `templated/`

use pkr_engine::{CopyRule, FileRenderer, RenderPlan};
use std::path::Path;

use crate::context::KardContext;
use crate::error::Result;

/// Output subfolder of the base render
pub const TEMPLATED_DIR: &str = "templated";

/// Template subfolder rendered into `templated/`
pub const BASE_TEMPLATES: &str = "base";

pub fn plan(ctx: &KardContext, renderer: &FileRenderer) -> Result<RenderPlan> {
    let mut plan = RenderPlan::new(&ctx.path);
    plan.manage(TEMPLATED_DIR);

    let base = ctx.source_base();
    let templated = Path::new(TEMPLATED_DIR);

    for require in ctx.env.requires(None)? {
        let rule = CopyRule::copy(&require.origin, &require.dst).with_exclude(require.exclude);
        plan.add_rule(templated, &rule, &base, None)?;
    }

    let templates = ctx.env.template_dir().join(BASE_TEMPLATES);
    if templates.is_dir() {
        let rule = CopyRule::render(templates.to_string_lossy(), "");
        plan.add_rule(templated, &rule, &base, Some(renderer))?;
    } else {
        tracing::debug!(path = %templates.display(), "no base templates");
    }

    Ok(plan)
}
