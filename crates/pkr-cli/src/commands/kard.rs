//! Kard commands - create, update, make, list and select kards

use pkr_core::{Meta, MetaSource, SourceKind, parse_extra};
use pkr_driver::{Lifecycle, Overrides};
use pkr_driver::features::split_features;
use std::path::Path;

use super::{Globals, Session};
use crate::display::{print_apply_report, print_list, spinner, success, warning};
use crate::error::Result;

/// Overrides from `--meta`, `--features` and `--extra`
fn overrides(meta: Option<&Path>, features: Option<&str>, extra: &[String]) -> Result<Overrides> {
    let meta_file = match meta {
        Some(path) => Some(Meta::from(
            MetaSource::from_file(SourceKind::CliMetaFile, path)?.payload,
        )),
        None => None,
    };
    Ok(Overrides {
        extra: parse_extra(extra)?,
        meta_file,
        features: features.map(split_features).unwrap_or_default(),
        ..Overrides::default()
    })
}

pub fn create(
    globals: &Globals,
    name: &str,
    env: &str,
    driver: Option<String>,
    meta: Option<&Path>,
    features: Option<&str>,
    extra: &[String],
) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();

    let mut overrides = overrides(meta, features, extra)?;
    overrides.env = Some(env.to_string());
    overrides.driver = driver;

    let kard = lifecycle.create(name, overrides)?;
    lifecycle.set_current(name)?;

    success(format!(
        "kard {} created (env {}, driver {})",
        name, kard.record.env, kard.driver
    ));
    println!("Current kard is now: {name}");
    Ok(())
}

pub fn update(
    globals: &Globals,
    meta: Option<&Path>,
    features: Option<&str>,
    extra: &[String],
) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    lifecycle.update(&name, overrides(meta, features, extra)?)?;
    success(format!("kard {name} updated"));
    Ok(())
}

pub fn make(globals: &Globals, reset: bool) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;

    let bar = spinner(format!("making kard {name}"), session.quiet());
    let result = lifecycle.make(&name, reset);
    bar.finish_and_clear();

    print_apply_report(&result?, &lifecycle.kard_path(&name));
    Ok(())
}

pub async fn list(globals: &Globals, kubernetes: bool) -> Result<()> {
    let session = Session::open(globals)?;
    let kards = kard_names(&session.lifecycle(), kubernetes).await?;
    print_list("Kards:", &kards, "No kard found.");
    Ok(())
}

/// Local kards, then the cluster ones as `k8s/<name>`
async fn kard_names(lifecycle: &Lifecycle<'_>, kubernetes: bool) -> Result<Vec<String>> {
    let mut kards = lifecycle.list()?;
    if kubernetes {
        kards.extend(lifecycle.list_cluster().await?);
    }
    Ok(kards)
}

pub fn get(globals: &Globals) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    println!("Current kard: {}", session.kard(&lifecycle)?);
    Ok(())
}

pub fn load(globals: &Globals, name: &str) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    // loading validates the stored state before switching to it
    lifecycle.load(name)?;
    lifecycle.set_current(name)?;
    println!("Current kard is now: {name}");
    Ok(())
}

pub fn dump(globals: &Globals, cleaned: bool) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let name = session.kard(&lifecycle)?;
    print!("{}", lifecycle.dump(&name, cleaned)?);
    Ok(())
}

pub fn remove(globals: &Globals, name: &str) -> Result<()> {
    let session = Session::open(globals)?;
    let lifecycle = session.lifecycle();
    let was_current = lifecycle.store().current().is_ok_and(|current| current == name);
    lifecycle.remove(name)?;
    success(format!("kard {name} removed"));
    if was_current {
        warning("it was the current kard; select another one with `pkr kard load`");
    }
    Ok(())
}
