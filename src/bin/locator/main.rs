//! Runs a station, or a dedicated locator, against an MQTT broker.

use acousticlocator::{
    args::{LocatorArgs, LocatorCommand},
    audio::{AudioSource, SyntheticSource, WavSource},
    controller::{run_locator, StationController},
    error::LocatorError,
    transport::MqttTransport,
    Position,
};

use clap::Parser;
use log::{error, info};
use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

// Example:
// cargo run --bin locator -- --host broker.local station -c station-a.ron -w recording.wav
// cargo run --bin locator -- --host broker.local locate --peers station-a station-b

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = LocatorArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Sets `stop` on Ctrl-C.
fn stop_on_interrupt(stop: Arc<AtomicBool>) -> Result<(), LocatorError> {
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| LocatorError::Config(format!("cannot install interrupt handler: {}", e)))
}

fn run(args: &LocatorArgs) -> Result<(), LocatorError> {
    match &args.command {
        LocatorCommand::Station(cmd) => {
            let config = cmd.load(&args.broker)?;

            let mut source: Box<dyn AudioSource> = match (&cmd.wav, &cmd.simulate) {
                (Some(path), _) => Box::new(WavSource::open(path, config.block_size, !cmd.fast)?),
                (None, Some(xyz)) => {
                    let geometry = config.geometry()?;
                    let source = Position::new(xyz[0], xyz[1], xyz[2]);
                    Box::new(
                        SyntheticSource::new(
                            &config.id,
                            &config.mic_world_positions(&geometry),
                            source,
                            config.freq,
                            config.sample_rate,
                            config.block_size,
                        )?
                        .realtime(!cmd.fast),
                    )
                }
                (None, None) => {
                    return Err(LocatorError::Config(
                        "no audio input, give --wav or --simulate".to_owned(),
                    ))
                }
            };

            let transport = Arc::new(MqttTransport::connect(&config.broker, &config.id)?);
            let mut controller = StationController::new(config, transport)?;
            stop_on_interrupt(controller.stop_flag())?;
            controller.run(source.as_mut())
        }
        LocatorCommand::Locate(cmd) => {
            let config = cmd.load(&args.broker)?;
            let transport = Arc::new(MqttTransport::connect(&config.broker, &config.id)?);
            let stop = Arc::new(AtomicBool::new(false));
            stop_on_interrupt(Arc::clone(&stop))?;

            let located = run_locator(&config, transport, stop)?;
            info!("{} location(s) reported", located);
            Ok(())
        }
    }
}
