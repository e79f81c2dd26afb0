//! Listext command - features of the current kard, or every available one

use console::style;

use super::{Globals, Session};
use crate::display::print_list;
use crate::error::Result;

pub fn run(globals: &Globals, all: bool) -> Result<()> {
    let session = Session::open(globals)?;

    if all {
        let lifecycle = session.lifecycle();
        println!("{}", style("Available features:").bold());
        for (name, plugin) in lifecycle.registry().iter() {
            println!(" - {:<16} {}", name, style(plugin.description()).dim());
        }
        return Ok(());
    }

    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;
    let stored = lifecycle.store().load(&name)?;
    print_list("Features:", &stored.features, "No feature enabled.");
    Ok(())
}
