/*!
Frame callback handler.

Runs on the detector SDK's event thread when an acquisition finishes. The
frame is borrowed only for the copy; everything else is published through
the value table.
*/

use shared::pvdb::{names, DATA_TYPE_UINT32};
use shared::{Frame, Value, ValueTable};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::device::{Detector, DeviceError, EventHandler, EventKind};

/// The detector is 2-D; the third extent is always published as zero
const NDIMENSIONS: i64 = 2;

/// Publishes the last completed frame into the value table
pub struct FrameCallback {
    table: Arc<ValueTable>,
    device: Weak<dyn Detector>,
}

impl FrameCallback {
    /// The device is held weakly: it owns the handler while registered
    pub fn new(table: Arc<ValueTable>, device: &Arc<dyn Detector>) -> Self {
        Self {
            table,
            device: Arc::downgrade(device),
        }
    }

    /// Wrap into a handler suitable for `Detector::register_event`
    pub fn into_handler(self) -> EventHandler {
        Arc::new(move |kind: EventKind| {
            if kind != EventKind::AcquisitionFinished {
                return;
            }
            if let Err(e) = self.publish_last_frame() {
                warn!("Frame callback could not publish data: {}", e);
            }
        })
    }

    /// Copy the last frame out of the device and publish it with its
    /// dimensions. Dimensions always come from the detector geometry.
    pub fn publish_last_frame(&self) -> Result<(), DeviceError> {
        let device = self.device.upgrade().ok_or(DeviceError::Disconnected)?;
        let (width, height) = (device.width(), device.height());

        let mut pixels = None;
        device.with_last_frame(&mut |frame| {
            pixels = Some(Frame::new(width, height, frame.pixels).to_owned_pixels());
        })?;
        let pixels = pixels.ok_or(DeviceError::NoFrame)?;

        // areaDetector describes an image as column, row, layer
        let (x, y) = (i64::from(width), i64::from(height));
        let table = &self.table;
        table.set(names::NDIMENSIONS, Value::Int(NDIMENSIONS));
        table.set(names::DIMENSIONS, Value::int_array(vec![x, y, 0]));
        table.set(names::DATA_TYPE, Value::Enum(DATA_TYPE_UINT32));
        table.set(names::ARRAY_DATA, Value::IntArray(pixels));
        table.set(names::ARRAY_SIZE_X, Value::Int(x));
        table.set(names::ARRAY_SIZE_Y, Value::Int(y));
        table.set(names::ARRAY_SIZE_Z, Value::Int(0));

        let counter = table
            .get(names::ARRAY_COUNTER)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;
        table.set(names::ARRAY_COUNTER, Value::Int(counter));

        debug!("Published frame {} ({}x{})", counter, width, height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::OutputFormat;
    use crate::simulated::SimulatedDetector;
    use shared::pvdb::{declarations, DatabaseDefaults};
    use std::time::Duration;

    fn setup(width: u32, height: u32) -> (Arc<ValueTable>, Arc<dyn Detector>) {
        let table = Arc::new(ValueTable::new(declarations(&DatabaseDefaults::default())));
        let device: Arc<dyn Detector> =
            Arc::new(SimulatedDetector::new("sim", width, height, Duration::ZERO).unwrap());
        (table, device)
    }

    #[test]
    fn test_publishes_fixed_geometry() {
        let (table, device) = setup(8, 5);
        device
            .run_acquisition(1, Duration::ZERO, OutputFormat::AutoDetect, None)
            .unwrap();

        FrameCallback::new(Arc::clone(&table), &device)
            .publish_last_frame()
            .unwrap();

        assert_eq!(table.get(names::NDIMENSIONS), Some(Value::Int(2)));
        assert_eq!(table.get(names::ARRAY_SIZE_X), Some(Value::Int(8)));
        assert_eq!(table.get(names::ARRAY_SIZE_Y), Some(Value::Int(5)));
        assert_eq!(table.get(names::ARRAY_SIZE_Z), Some(Value::Int(0)));
        assert_eq!(table.get(names::DIMENSIONS), Some(Value::int_array(vec![8, 5, 0])));
        assert_eq!(table.get(names::ARRAY_DATA).unwrap().as_array().unwrap().len(), 40);
        assert_eq!(table.get(names::ARRAY_COUNTER), Some(Value::Int(1)));
    }

    #[test]
    fn test_no_frame_leaves_table_untouched() {
        let (table, device) = setup(8, 5);
        let callback = FrameCallback::new(Arc::clone(&table), &device);

        assert!(matches!(callback.publish_last_frame(), Err(DeviceError::NoFrame)));
        assert_eq!(table.get(names::ARRAY_SIZE_X), Some(Value::Int(0)));
        assert_eq!(table.get(names::NDIMENSIONS), Some(Value::Int(3)));
    }

    #[test]
    fn test_registered_handler_runs_on_acquisition_finished() {
        let (table, device) = setup(4, 4);
        let handler = FrameCallback::new(Arc::clone(&table), &device).into_handler();
        let id = device.register_event(EventKind::AcquisitionFinished, handler);

        device
            .run_acquisition(2, Duration::ZERO, OutputFormat::AutoDetect, None)
            .unwrap();
        assert!(device.unregister_event(EventKind::AcquisitionFinished, id));

        assert_eq!(table.get(names::ARRAY_COUNTER), Some(Value::Int(1)));
        assert_eq!(table.get(names::ARRAY_SIZE_X), Some(Value::Int(4)));
    }

    #[test]
    fn test_dropped_device_reports_disconnected() {
        let (table, device) = setup(4, 4);
        let callback = FrameCallback::new(table, &device);
        drop(device);

        assert!(matches!(callback.publish_last_frame(), Err(DeviceError::Disconnected)));
    }
}
