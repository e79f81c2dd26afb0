//! Render the environment's `templates` entries into the kard

use pkr_core::write_atomic;
use pkr_engine::FileRenderer;

use super::Plugin;
use crate::context::KardContext;
use crate::error::Result;

pub struct BasicTemplate;

impl Plugin for BasicTemplate {
    fn name(&self) -> &'static str {
        "basic_template"
    }

    fn description(&self) -> &'static str {
        "render each env `templates` entry {template, dst} into the kard"
    }

    fn populate_kard(&self, ctx: &KardContext, renderer: &FileRenderer) -> Result<()> {
        for extra in ctx.env.extra_templates()? {
            let content = renderer.render_file(&ctx.root.resolve(&extra.template))?;
            let dest = ctx.path.join(&extra.dst);
            if std::fs::read(&dest).is_ok_and(|old| old == content.as_bytes()) {
                continue;
            }
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tracing::debug!(dest = %dest.display(), "rendering extra template");
            write_atomic(&dest, content.as_bytes())?;
        }
        Ok(())
    }
}
