//! PixelPusher command datagrams.
//!
//! A command datagram is distinguished from a pixel datagram by the 16-byte
//! [`COMMAND_MAGIC`] prefix that follows the packet index. The magic is
//! followed by a single command byte and a command-specific body.

use std::fmt;

use crate::error::ProtocolError;
use crate::io::ByteSliceReader;

/// The magic byte sequence that precedes PixelPusher commands.
pub const COMMAND_MAGIC: [u8; 16] = [
    0x40, 0x09, 0x2d, 0xa6, 0x15, 0xa5, 0xdd, 0xe5, //
    0x6a, 0x9d, 0x4d, 0x5a, 0xcf, 0x09, 0xaf, 0x50,
];

/// An individual PixelPusher command identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Reset = 0x01,
    GlobalBrightnessSet = 0x02,
    WifiConfigure = 0x03,
    LedConfigure = 0x04,
    StripBrightnessSet = 0x05,
}

/// A WiFi security mode carried by [`Command::WifiConfigure`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Security(pub u8);

impl Security {
    pub const NONE: Security = Security(0);
    pub const WEP: Security = Security(1);
    pub const WPA: Security = Security(2);
    pub const WPA2: Security = Security(3);
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Security::NONE => write!(f, "NONE"),
            Security::WEP => write!(f, "WEP"),
            Security::WPA => write!(f, "WPA"),
            Security::WPA2 => write!(f, "WPA2"),
            Security(v) => write!(f, "UNKNOWN({})", v),
        }
    }
}

/// A pixel colour ordering carried by [`Command::LedConfigure`].
///
/// `RGB=0, RBG=1, GBR=2, GRB=3, BGR=4, BRG=5`; encoded as a u64 on the
/// wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColourOrder(pub u64);

impl ColourOrder {
    pub const RGB: ColourOrder = ColourOrder(0);
    pub const RBG: ColourOrder = ColourOrder(1);
    pub const GBR: ColourOrder = ColourOrder(2);
    pub const GRB: ColourOrder = ColourOrder(3);
    pub const BGR: ColourOrder = ColourOrder(4);
    pub const BRG: ColourOrder = ColourOrder(5);
}

/// The body of a [`Command::LedConfigure`] command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedConfigure {
    pub num_strips: u32,
    pub strip_length: u32,
    pub strip_type: u64,
    pub colour_order: ColourOrder,
    pub group: u16,
    pub controller: u16,
    pub artnet_universe: u16,
    pub artnet_channel: u16,
}

/// A PixelPusher command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Reset the device.
    Reset,
    /// Set the global brightness level.
    GlobalBrightnessSet { parameter: u16 },
    /// Configure the device's WiFi connection.
    WifiConfigure {
        ssid: String,
        key: String,
        security: Security,
    },
    /// Configure the device's LED strips.
    LedConfigure(LedConfigure),
    /// Set the brightness level of a single strip.
    StripBrightnessSet { strip: u8, parameter: u16 },
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::Reset => CommandId::Reset,
            Command::GlobalBrightnessSet { .. } => CommandId::GlobalBrightnessSet,
            Command::WifiConfigure { .. } => CommandId::WifiConfigure,
            Command::LedConfigure(_) => CommandId::LedConfigure,
            Command::StripBrightnessSet { .. } => CommandId::StripBrightnessSet,
        }
    }

    /// Reads a command from `r`.
    ///
    /// When `consume_magic` is set, the input must begin with
    /// [`COMMAND_MAGIC`].
    pub fn read(r: &mut ByteSliceReader<'_>, consume_magic: bool) -> Result<Self, ProtocolError> {
        if consume_magic {
            let magic = r.next(COMMAND_MAGIC.len()).ok_or(ProtocolError::Truncated {
                context: "command magic",
            })?;
            if magic.as_ref() != COMMAND_MAGIC {
                return Err(ProtocolError::BadCommandMagic);
            }
        }

        let cmd_byte = r.read_u8().ok_or(ProtocolError::Truncated {
            context: "command byte",
        })?;

        match cmd_byte {
            0x01 => Ok(Command::Reset),
            0x02 => {
                let parameter = r.read_u16_le().ok_or(ProtocolError::Truncated {
                    context: "global brightness parameter",
                })?;
                Ok(Command::GlobalBrightnessSet { parameter })
            }
            0x03 => {
                let ssid = read_nul_terminated(r, "wifi ssid")?;
                let key = read_nul_terminated(r, "wifi key")?;
                let security = r.read_u8().ok_or(ProtocolError::Truncated {
                    context: "wifi security byte",
                })?;
                Ok(Command::WifiConfigure {
                    ssid,
                    key,
                    security: Security(security),
                })
            }
            0x04 => {
                let truncated = ProtocolError::Truncated {
                    context: "led configure body",
                };
                Ok(Command::LedConfigure(LedConfigure {
                    num_strips: r.read_u32_le().ok_or(truncated.clone())?,
                    strip_length: r.read_u32_le().ok_or(truncated.clone())?,
                    strip_type: r.read_u64_le().ok_or(truncated.clone())?,
                    colour_order: ColourOrder(r.read_u64_le().ok_or(truncated.clone())?),
                    group: r.read_u16_le().ok_or(truncated.clone())?,
                    controller: r.read_u16_le().ok_or(truncated.clone())?,
                    artnet_universe: r.read_u16_le().ok_or(truncated.clone())?,
                    artnet_channel: r.read_u16_le().ok_or(truncated)?,
                }))
            }
            0x05 => {
                let truncated = ProtocolError::Truncated {
                    context: "strip brightness body",
                };
                let strip = r.read_u8().ok_or(truncated.clone())?;
                let parameter = r.read_u16_le().ok_or(truncated)?;
                Ok(Command::StripBrightnessSet { strip, parameter })
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    /// Writes this command to `buf`.
    ///
    /// When `write_magic` is set, [`COMMAND_MAGIC`] is written first.
    pub fn write(&self, buf: &mut Vec<u8>, write_magic: bool) {
        if write_magic {
            buf.extend_from_slice(&COMMAND_MAGIC);
        }
        buf.push(self.id() as u8);

        match self {
            Command::Reset => {}
            Command::GlobalBrightnessSet { parameter } => {
                buf.extend_from_slice(&parameter.to_le_bytes());
            }
            Command::WifiConfigure {
                ssid,
                key,
                security,
            } => {
                buf.extend_from_slice(ssid.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(key.as_bytes());
                buf.push(0x00);
                buf.push(security.0);
            }
            Command::LedConfigure(lc) => {
                buf.extend_from_slice(&lc.num_strips.to_le_bytes());
                buf.extend_from_slice(&lc.strip_length.to_le_bytes());
                buf.extend_from_slice(&lc.strip_type.to_le_bytes());
                buf.extend_from_slice(&lc.colour_order.0.to_le_bytes());
                buf.extend_from_slice(&lc.group.to_le_bytes());
                buf.extend_from_slice(&lc.controller.to_le_bytes());
                buf.extend_from_slice(&lc.artnet_universe.to_le_bytes());
                buf.extend_from_slice(&lc.artnet_channel.to_le_bytes());
            }
            Command::StripBrightnessSet { strip, parameter } => {
                buf.push(*strip);
                buf.extend_from_slice(&parameter.to_le_bytes());
            }
        }
    }
}

fn read_nul_terminated(
    r: &mut ByteSliceReader<'_>,
    context: &'static str,
) -> Result<String, ProtocolError> {
    let mut bytes = Vec::new();
    loop {
        match r.read_u8() {
            Some(0x00) => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Some(b) => bytes.push(b),
            None => return Err(ProtocolError::Truncated { context }),
        }
    }
}
