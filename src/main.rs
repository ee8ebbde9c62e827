use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use arscope_rs::arm_config::{ArmConfig, ModelConfig};
use arscope_rs::image_pipeline::captor::create_captor;
use arscope_rs::image_pipeline::inference::{ConstantEngine, ModelType, ObjectiveLensPower};
use arscope_rs::logger;
use arscope_rs::main_looper::{Looper, Previewer};
use arscope_rs::microdisplay::ContourLoggingDisplay;

/// Bring-up harness: runs the whole pipeline against the test-pattern
/// captor and a constant-output engine, exercises a model switch, and
/// drops a preview snapshot before shutting down.
fn main() -> Result<()> {
    logger::init();

    info!("Starting arscope...");

    let config = Arc::new(
        ArmConfig::builder()
            .image_size(256)
            .sensor(512, 512, 2)
            .num_debayer_threads(4)
            .rgb_gains(1.6, 1.0, 2.1)
            .loop_delay(Duration::from_millis(30))
            .preview_delay(Duration::from_millis(100))
            .model_override(
                ModelType::Lyna,
                ObjectiveLensPower::Objective10x,
                ModelConfig {
                    absolute_model_path: Some("/models/lyna_10x".into()),
                    ..ModelConfig::default()
                },
            )
            .model_override(
                ModelType::Gleason,
                ObjectiveLensPower::Objective10x,
                ModelConfig {
                    absolute_model_path: Some("/models/gleason_10x".into()),
                    blur_size: 7,
                    ..ModelConfig::default()
                },
            )
            .objective_position(1, ObjectiveLensPower::Objective10x)
            .build(),
    );

    let captor = create_captor(&config);
    let engine = Box::new(ConstantEngine::new(23, 23, 4).positive_value(0xc0));
    let microdisplay = Box::new(ContourLoggingDisplay::new(
        &config,
        config.image_size,
        config.image_size,
    ));

    let previewer = Arc::new(Previewer::new(config.clone()));
    let mut looper = Looper::new(
        config,
        captor,
        engine,
        ModelType::Lyna,
        ObjectiveLensPower::Objective10x,
        microdisplay,
    );
    looper.set_previewer(previewer.clone());
    let control = looper.control();

    let looper_thread = std::thread::spawn(move || looper.run());
    let preview_thread = {
        let previewer = previewer.clone();
        std::thread::spawn(move || previewer.run())
    };

    std::thread::sleep(Duration::from_secs(2));
    info!("Switching to the prostate model");
    control.set_objective_and_model_type(ModelType::Gleason, ObjectiveLensPower::Objective10x);
    std::thread::sleep(Duration::from_secs(1));
    info!("Restricting the overlay to Gleason pattern 3");
    control.set_positive_classes(vec![1]);
    std::thread::sleep(Duration::from_secs(1));

    let snapshot_dir = std::env::temp_dir().join("arscope-snapshot");
    match previewer.take_snapshot(&snapshot_dir) {
        Ok(dir) => info!("Snapshot saved under {}", dir.display()),
        Err(err) => info!("No snapshot taken: {err}"),
    }

    control.stop();
    previewer.stop();
    looper_thread
        .join()
        .map_err(|_| anyhow::anyhow!("looper thread panicked"))??;
    preview_thread
        .join()
        .map_err(|_| anyhow::anyhow!("preview thread panicked"))?;

    info!("Shutdown complete");
    Ok(())
}
