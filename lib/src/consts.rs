use std::ops::RangeInclusive;

/// Location of backlight devices
pub const DEVICES_PATH: &str = "/sys/class/backlight";

/// Filename for device's max brightness
pub const FILE_MAX_BRIGHTNESS: &str = "max_brightness";

/// Filename for current brightness.
pub const FILE_BRIGHTNESS: &str = "actual_brightness";

/// amdgpu drivers set the actual_brightness in a different scale than
/// [0, max_brightness], so we have to use the 'brightness' file instead.
pub const FILE_BRIGHTNESS_AMD: &str = "brightness";

/// set the requested brightness level
pub const FILE_BRIGHTNESS_WRITE: &str = "brightness";

/// Directory holding the i2c-dev character devices
pub const I2C_DEV_PATH: &str = "/dev";

/// Prefix of i2c-dev character devices
pub const I2C_DEV_PREFIX: &str = "i2c-";

/// 7-bit i2c address monitors answer DDC/CI on
pub const DDC_CI_ADDRESS: u8 = 0x37;

/// `I2C_SLAVE` ioctl request number from linux/i2c-dev.h
pub const I2C_SLAVE: u32 = 0x0703;

/// Location of industrial I/O devices, where ambient light sensors live
pub const IIO_DEVICES_PATH: &str = "/sys/bus/iio/devices";

pub const FILE_ILLUMINANCE_INPUT: &str = "in_illuminance_input";
pub const FILE_ILLUMINANCE_RAW: &str = "in_illuminance_raw";
pub const FILE_ILLUMINANCE_SCALE: &str = "in_illuminance_scale";
pub const FILE_ILLUMINANCE_OFFSET: &str = "in_illuminance_offset";

/// Range of valid values for `root_scaling`
pub const ROOT_SCALING_RANGE: RangeInclusive<f64> = 0.1..=10.;

/// Range of valid values for `Calibration`
pub const CALIBRATION_RANGE: RangeInclusive<f64> = 0.0..=100.;

/// Brightness is a percentage on every endpoint
pub const BRIGHTNESS_RANGE: RangeInclusive<u32> = 0..=100;

pub const LATITUDE_RANGE: RangeInclusive<f64> = -90.0..=90.0;
pub const LONGITUDE_RANGE: RangeInclusive<f64> = -180.0..=180.0;

pub const CONFIG_DIR: &str = "dimmer";
pub const CONFIG_FILE: &str = "config.toml";
