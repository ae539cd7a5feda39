//! GenICam feature names used by the acquisition session

/// Exposure time in microseconds (float)
pub const EXPOSURE_TIME: &str = "ExposureTime";
/// Acquisition frame rate in frames per second (float)
pub const ACQUISITION_FRAME_RATE: &str = "AcquisitionFrameRate";
/// Frame rate limiting mode (enum)
pub const ACQUISITION_FRAME_RATE_MODE: &str = "AcquisitionFrameRateMode";
/// Unlimited frame rate mode value
pub const FRAME_RATE_MODE_BASIC: &str = "Basic";
pub const BLACK_LEVEL: &str = "BlackLevel";
pub const GAIN: &str = "Gain";
pub const GAMMA: &str = "Gamma";
pub const WIDTH: &str = "Width";
pub const HEIGHT: &str = "Height";
pub const PIXEL_FORMAT: &str = "PixelFormat";
/// Bytes required per frame buffer (int)
pub const PAYLOAD_SIZE: &str = "PayloadSize";
pub const ACQUISITION_START: &str = "AcquisitionStart";
pub const ACQUISITION_STOP: &str = "AcquisitionStop";
pub const DEVICE_RESET: &str = "DeviceReset";
