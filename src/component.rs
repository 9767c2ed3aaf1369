//! Defines the Component trait, for work a station hands off to a thread of
//! its own so the station loop never waits on it.

use crate::error::LocatorError;

use log::{info, warn};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

///
/// A processing stage that consumes values of one type and produces values
/// of another, one for one. Components run on their own thread through
/// [`run_component()`], fed and drained through channels.
///
pub trait Component: ToString {
    /// What the component consumes
    type InData;
    /// What it produces for each input
    type OutData;

    /// Converts an input of type InData into an output of type OutData
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up once the input channel has closed
    fn finalize(&mut self) -> Result<(), LocatorError>;
}

/// Runs the given Component on its own thread. On receiving data of type
/// InData on the input channel, the Component converts them to data of type
/// OutData and sends it to the output channel. The thread finalizes the
/// component and exits once every sender of the input channel is dropped.
pub fn run_component<C: Component + Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> Result<JoinHandle<()>, LocatorError>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    let handle = thread::Builder::new()
        .name(component.to_string())
        .spawn(move || {
            while let Ok(data) = input.recv() {
                let out_data = component.convert(data);
                if output.send(out_data).is_err() {
                    warn!("{} : output channel closed.", component.to_string());
                }
            }

            if let Err(component_error) = component.finalize() {
                warn!(
                    "{} : error during terminating : {}.",
                    component.to_string(),
                    component_error
                );
            }
            info!("{} : terminated.", component.to_string());
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    /// Counts its inputs and tags every output with the count so far
    struct Counter {
        seen: usize,
    }

    impl Component for Counter {
        type InData = &'static str;
        type OutData = (usize, &'static str);

        fn convert(&mut self, input: &'static str) -> (usize, &'static str) {
            self.seen += 1;
            (self.seen, input)
        }

        fn finalize(&mut self) -> Result<(), LocatorError> {
            Ok(())
        }
    }

    impl ToString for Counter {
        fn to_string(&self) -> String {
            "Counter".to_string()
        }
    }

    #[test]
    fn test_component_runs_until_input_closes() {
        let (in_tx, in_rx) = channel();
        let (out_tx, out_rx) = channel();
        let handle = run_component(Box::new(Counter { seen: 0 }), in_rx, out_tx).unwrap();

        in_tx.send("first").unwrap();
        in_tx.send("second").unwrap();
        drop(in_tx);
        handle.join().unwrap();

        let outputs: Vec<_> = out_rx.iter().collect();
        assert_eq!(outputs, vec![(1, "first"), (2, "second")]);
    }
}
