#![warn(clippy::pedantic)]

use std::sync::Arc;

use pixelcast_core::{
    dither::DitherKind,
    distribution::SendExecutor,
    media::MediaSource,
    schedule::TokioScheduler,
    sink::OwnerId,
    storage::FsStorage,
    surface::{SequentialAllocator, SURFACE_SIZE},
    Collaborators, CreateRequest, MediaKind, Pipeline,
};

mod host;
mod settings;

#[cfg(all(feature = "jemallocator", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result as AnyResult;

/// Owner of everything imported from the command line.
const CONSOLE_OWNER: OwnerId = OwnerId::nil();

/// Size in surfaces needed to show an image of `pixels` at native resolution, within `max`.
fn surfaces_for(pixels: u32, max: u32) -> u32 {
    pixels.div_ceil(SURFACE_SIZE).clamp(1, max.max(1))
}

/// Queue an image file as a new resource and wait for it to be built.
fn import(pipeline: &Pipeline, path: &std::path::Path) -> AnyResult<()> {
    let (pixel_width, pixel_height) = image::image_dimensions(path)?;
    let limits = &pipeline.config().limits;
    let name = path
        .file_stem()
        .map_or_else(|| "untitled".to_owned(), |stem| stem.to_string_lossy().into_owned());
    let task = pipeline.create(CreateRequest {
        owner: CONSOLE_OWNER,
        name,
        width: surfaces_for(pixel_width, limits.max_width),
        height: surfaces_for(pixel_height, limits.max_height),
        source: MediaSource::Path(path.to_owned()),
        kind: MediaKind::Auto,
        ditherer: DitherKind::default(),
    })?;
    let resource = task.wait()?;
    log::info!(
        "imported {path:?} as {} ({}, {} surfaces)",
        resource.name(),
        resource.kind_name(),
        resource.surfaces().len()
    );
    Ok(())
}

/// Import each file in turn, returning how many made it. They all share one owner, and an owner
/// may only have one resource under construction at a time.
fn import_all(pipeline: &Pipeline, paths: &[std::path::PathBuf]) -> usize {
    paths
        .iter()
        .filter(|path| match import(pipeline, path) {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to import {path:?}: {e:#}");
                false
            }
        })
        .count()
}

fn main() -> AnyResult<()> {
    let has_term = std::io::IsTerminal::is_terminal(&std::io::stdin());
    // Log to a terminal, if available. Else, log to "log.out" in the working directory.
    if has_term {
        env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        let _ = simple_logging::log_to_file("log.out", log::LevelFilter::Debug);
    }

    let settings = settings::Settings::load();
    if let Err(e) = settings.save_if_missing() {
        log::warn!("Failed to save default config:\n{e:?}");
    }
    if settings.did_fail_to_load() {
        log::info!("Running with default config");
    }
    let config = settings.config;

    // Args are image paths to import at startup, plus `--watch` to attach a logging viewer.
    let mut watch = false;
    let paths: Vec<std::path::PathBuf> = std::env::args_os()
        .skip(1)
        .filter(|arg| {
            if arg == "--watch" {
                watch = true;
                false
            } else {
                true
            }
        })
        .map(Into::into)
        .collect();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pixelcast-tick")
        .build()?;

    let data_dir = settings::data_dir();
    log::info!("Storing resources in {data_dir:?}");
    let watchers = Arc::new(host::Watchers::default());
    let sink = Arc::new(host::LogSink::default());
    let executor = SendExecutor::pool(config.distribution.send_workers)?;
    let pipeline = Pipeline::new(
        config,
        Collaborators {
            storage: Arc::new(FsStorage::open(data_dir)?),
            allocator: Arc::new(SequentialAllocator::new()),
            presence: watchers.clone(),
            sink: sink.clone(),
            scheduler: Arc::new(TokioScheduler::new(runtime.handle().clone())),
        },
        executor,
    )?;

    let restored = pipeline.restore()?;
    log::info!("Restored {restored} resources");
    pipeline.start();

    let imported = import_all(&pipeline, &paths);
    if !paths.is_empty() && imported == 0 {
        log::warn!("Failed to import any provided image.");
    }

    let viewer = watch.then(uuid::Uuid::new_v4);
    if let Some(viewer) = viewer {
        watchers.connect(viewer);
        pipeline.viewer_connected(viewer);
        log::info!("Watching as {viewer}");
    }

    log::info!("Running, Ctrl-C to stop");
    runtime.block_on(tokio::signal::ctrl_c())?;

    if let Some(viewer) = viewer {
        pipeline.viewer_disconnected(viewer);
        watchers.disconnect(viewer);
    }
    pipeline.close();
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    // Precision loss is fine for display.
    #[allow(clippy::cast_precision_loss)]
    let sent = human_bytes::human_bytes(sink.sent_bytes() as f64);
    log::info!("Shut down after sending {sent}");
    Ok(())
}
