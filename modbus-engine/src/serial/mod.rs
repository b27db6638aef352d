use std::time::Duration;

use crate::common::phys::{inter_frame_delay, LineTiming};

pub(crate) mod frame;
pub(crate) mod server;

/// Number of data bits per character
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum DataBits {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    #[default]
    Eight,
}

/// Flow control
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Parity checking
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
    /// Parity bit always 1
    Mark,
    /// Parity bit always 0
    Space,
}

/// Number of stop bits
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum StopBits {
    /// 1 stop bit
    #[default]
    One,
    /// 1.5 stop bits
    OnePointFive,
    /// 2 stop bits
    Two,
}

/// RS-485 transceiver options
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Rs485Settings {
    /// drive RTS high while sending
    pub rts_on_send: bool,
    /// enable the bus termination resistor
    pub termination: bool,
    /// receive our own transmissions
    pub echo: bool,
    /// delay after enabling the transmitter, in microseconds
    pub delay_before_send_us: u32,
    /// delay before disabling the transmitter, in microseconds
    pub delay_after_send_us: u32,
}

/// Serial port settings
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SerialSettings {
    /// Baud rate of the port
    pub baud_rate: u32,
    /// Number of data bits
    pub data_bits: DataBits,
    /// Types of flow control
    pub flow_control: FlowControl,
    /// Number of stop bits
    pub stop_bits: StopBits,
    /// Parity setting
    pub parity: Parity,
    /// Timeout of a single read on the port
    pub read_timeout: Duration,
    /// RS-485 options, if the port drives an RS-485 transceiver
    pub rs485: Option<Rs485Settings>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            stop_bits: StopBits::One,
            parity: Parity::None,
            read_timeout: Duration::from_secs(1),
            rs485: None,
        }
    }
}

impl SerialSettings {
    /// Settings for `baud_rate` with everything else at its default
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    /// Set the data bits, parity and stop bits
    pub fn with_format(self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Self {
        Self {
            data_bits,
            parity,
            stop_bits,
            ..self
        }
    }

    /// Drive an RS-485 transceiver
    pub fn with_rs485(self, rs485: Rs485Settings) -> Self {
        Self {
            rs485: Some(rs485),
            ..self
        }
    }

    /// Silence and transceiver delays applied around every frame sent
    pub(crate) fn line_timing(&self) -> LineTiming {
        let rs485 = self.rs485.unwrap_or_default();
        LineTiming {
            inter_frame: inter_frame_delay(self.baud_rate),
            before_send: Duration::from_micros(rs485.delay_before_send_us.into()),
            after_send: Duration::from_micros(rs485.delay_after_send_us.into()),
        }
    }
}

#[cfg(feature = "serial")]
pub use driver::SerialConnector;

#[cfg(feature = "serial")]
mod driver {
    use std::io::{Error, ErrorKind};

    use super::*;
    use crate::common::phys::{ConnectFuture, Connector, PhysLayer};

    /// Opens a serial port for Modbus/RTU
    #[derive(Clone, Debug)]
    pub struct SerialConnector {
        path: String,
        settings: SerialSettings,
    }

    impl SerialConnector {
        /// Connector for the port at `path` ("/dev/ttyUSB0", "COM3", ...)
        pub fn new(path: &str, settings: SerialSettings) -> Self {
            Self {
                path: path.to_string(),
                settings,
            }
        }

        /// Settings the port is opened with
        pub fn settings(&self) -> SerialSettings {
            self.settings
        }

        fn open(&self) -> std::io::Result<PhysLayer> {
            let builder = builder(&self.path, &self.settings)?;
            let port = tokio_serial::SerialStream::open(&builder)
                .map_err(|err| Error::new(ErrorKind::Other, err))?;

            if let Some(rs485) = self.settings.rs485 {
                tracing::info!(
                    "RS-485 rts on send: {} termination: {} echo: {} (handled by the serial driver)",
                    rs485.rts_on_send,
                    rs485.termination,
                    rs485.echo
                );
            }

            tracing::info!("serial port open: {}", self.path);
            Ok(PhysLayer::new_serial(port, self.settings.line_timing()))
        }
    }

    impl Connector for SerialConnector {
        fn connect(&self) -> ConnectFuture<'_> {
            Box::pin(async move { self.open() })
        }
    }

    pub(super) fn builder(
        path: &str,
        settings: &SerialSettings,
    ) -> std::io::Result<tokio_serial::SerialPortBuilder> {
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Mark | Parity::Space => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("{:?} parity is not supported by the serial driver", settings.parity),
                ))
            }
        };

        let stop_bits = match settings.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "1.5 stop bits are not supported by the serial driver",
                ))
            }
        };

        let data_bits = match settings.data_bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        };

        let flow_control = match settings.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        Ok(tokio_serial::new(path, settings.baud_rate)
            .data_bits(data_bits)
            .flow_control(flow_control)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(settings.read_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_9600_8n1() {
        let settings = SerialSettings::default();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(settings.rs485, None);
    }

    #[test]
    fn line_timing_includes_rs485_delays() {
        let settings = SerialSettings::new(115200).with_rs485(Rs485Settings {
            delay_before_send_us: 500,
            delay_after_send_us: 250,
            ..Rs485Settings::default()
        });
        let timing = settings.line_timing();
        assert_eq!(timing.inter_frame, Duration::from_micros(1750));
        assert_eq!(timing.before_send, Duration::from_micros(500));
        assert_eq!(timing.after_send, Duration::from_micros(250));
    }

    #[cfg(feature = "serial")]
    #[test]
    fn unsupported_formats_fail_to_open() {
        let mark = SerialSettings::default().with_format(DataBits::Eight, Parity::Mark, StopBits::One);
        assert_eq!(
            driver::builder("/dev/null", &mark).err().map(|x| x.kind()),
            Some(std::io::ErrorKind::InvalidInput)
        );

        let one_and_half =
            SerialSettings::default().with_format(DataBits::Eight, Parity::None, StopBits::OnePointFive);
        assert_eq!(
            driver::builder("/dev/null", &one_and_half).err().map(|x| x.kind()),
            Some(std::io::ErrorKind::InvalidInput)
        );

        assert!(driver::builder("/dev/null", &SerialSettings::default()).is_ok());
    }
}
