/// This module implements `ResourceAddress` which is used for parsing
/// VISA resource strings of the form "GPIB0::6::INSTR"
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

const MAX_GPIB_ADDR: u8 = 30;

/// The interface-specific part of a resource address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Interface {
    Gpib {
        primary: u8,
        secondary: Option<u8>,
    },
    /// The controller board itself, `GPIB0::INTFC`.
    GpibBoard,
    Asrl {
        device: Option<String>,
    },
    TcpipInstr {
        host: String,
        lan_device: Option<String>,
    },
    TcpipSocket {
        host: String,
        port: u16,
    },
    Usb {
        vendor: u16,
        product: u16,
        serial: String,
        interface_number: Option<u16>,
        raw: bool,
    },
}

/// A validated resource address. Addresses are immutable once parsed and
/// render in canonical form: upper-case keywords, explicit board index and
/// explicit resource class.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    board: u16,
    interface: Interface,
}

enum Class {
    Instr,
    Intfc,
    Socket,
    Raw,
}

impl Class {
    fn parse(x: &str) -> Option<Self> {
        match x.to_ascii_uppercase().as_str() {
            "INSTR" => Some(Class::Instr),
            "INTFC" => Some(Class::Intfc),
            "SOCKET" => Some(Class::Socket),
            "RAW" => Some(Class::Raw),
            _ => None,
        }
    }
}

fn split_keyword(head: &str) -> Option<(&'static str, &str)> {
    let upper = head.to_ascii_uppercase();
    for keyword in ["GPIB", "ASRL", "TCPIP", "USB"] {
        if upper.starts_with(keyword) {
            return Some((keyword, &head[keyword.len()..]));
        }
    }
    None
}

fn parse_board(x: &str) -> Option<u16> {
    if x.is_empty() {
        Some(0)
    } else if x.bytes().all(|b| b.is_ascii_digit()) {
        x.parse().ok()
    } else {
        None
    }
}

fn parse_u16(x: &str) -> Option<u16> {
    let lower = x.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        u16::from_str_radix(hex, 16).ok()
    } else {
        x.parse().ok()
    }
}

fn parse_gpib_addr(x: &str) -> Option<u8> {
    x.parse::<u8>().ok().filter(|addr| *addr <= MAX_GPIB_ADDR)
}

impl ResourceAddress {
    /// Create a new `ResourceAddress` by parsing the given address string.
    /// This is a purely syntactic check; the bus is not touched.
    pub fn parse(addr: &str) -> crate::Result<Self> {
        let invalid = |reason: &str| Error::invalid_address(addr, reason);

        let trimmed = addr.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty address"));
        }
        let mut splits: Vec<&str> = trimmed.split("::").collect();
        if splits.iter().any(|x| x.trim().is_empty()) {
            return Err(invalid("empty address segment"));
        }

        let (keyword, board) =
            split_keyword(splits[0]).ok_or_else(|| invalid("unknown interface type"))?;

        let class = match splits.last().and_then(|x| Class::parse(x)) {
            Some(class) if splits.len() > 1 => {
                splits.pop();
                Some(class)
            }
            _ => None,
        };
        let rest = &splits[1..];

        if keyword == "ASRL" {
            if !rest.is_empty() {
                return Err(invalid("unexpected segments after serial resource"));
            }
            if !matches!(class, None | Some(Class::Instr)) {
                return Err(invalid("serial resources only support INSTR"));
            }
            return Ok(match parse_board(board) {
                Some(board) => ResourceAddress {
                    board,
                    interface: Interface::Asrl { device: None },
                },
                None => ResourceAddress {
                    board: 0,
                    interface: Interface::Asrl {
                        device: Some(board.to_string()),
                    },
                },
            });
        }

        let board = parse_board(board).ok_or_else(|| invalid("invalid board index"))?;

        let interface = match keyword {
            "GPIB" => match class {
                Some(Class::Intfc) => {
                    if !rest.is_empty() {
                        return Err(invalid("INTFC takes no device address"));
                    }
                    Interface::GpibBoard
                }
                None | Some(Class::Instr) => {
                    if rest.is_empty() || rest.len() > 2 {
                        return Err(invalid("expected primary and optional secondary address"));
                    }
                    let primary = parse_gpib_addr(rest[0])
                        .ok_or_else(|| invalid("primary address must be within 0..=30"))?;
                    let secondary = match rest.get(1) {
                        Some(x) => Some(
                            parse_gpib_addr(x)
                                .ok_or_else(|| invalid("secondary address must be within 0..=30"))?,
                        ),
                        None => None,
                    };
                    Interface::Gpib { primary, secondary }
                }
                _ => return Err(invalid("GPIB resources support INSTR or INTFC")),
            },
            "TCPIP" => match class {
                Some(Class::Socket) => {
                    if rest.len() != 2 {
                        return Err(invalid("expected host and port"));
                    }
                    let port: u16 = rest[1]
                        .parse()
                        .ok()
                        .filter(|port| *port != 0)
                        .ok_or_else(|| invalid("invalid port"))?;
                    Interface::TcpipSocket {
                        host: rest[0].to_string(),
                        port,
                    }
                }
                None | Some(Class::Instr) => {
                    if rest.is_empty() || rest.len() > 2 {
                        return Err(invalid("expected host and optional LAN device name"));
                    }
                    Interface::TcpipInstr {
                        host: rest[0].to_string(),
                        lan_device: rest.get(1).map(|x| x.to_string()),
                    }
                }
                _ => return Err(invalid("TCPIP resources support INSTR or SOCKET")),
            },
            "USB" => {
                let raw = match class {
                    None | Some(Class::Instr) => false,
                    Some(Class::Raw) => true,
                    _ => return Err(invalid("USB resources support INSTR or RAW")),
                };
                if rest.len() != 3 && rest.len() != 4 {
                    return Err(invalid(
                        "expected vendor id, product id, serial number and optional interface",
                    ));
                }
                let vendor = parse_u16(rest[0]).ok_or_else(|| invalid("invalid vendor id"))?;
                let product = parse_u16(rest[1]).ok_or_else(|| invalid("invalid product id"))?;
                let interface_number = match rest.get(3) {
                    Some(x) => Some(x.parse().map_err(|_| invalid("invalid USB interface"))?),
                    None => None,
                };
                Interface::Usb {
                    vendor,
                    product,
                    serial: rest[2].to_string(),
                    interface_number,
                    raw,
                }
            }
            _ => return Err(invalid("unknown interface type")),
        };
        Ok(ResourceAddress { board, interface })
    }

    pub fn board(&self) -> u16 {
        self.board
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// The `(primary, secondary)` GPIB address, if this is a GPIB instrument.
    pub fn gpib_address(&self) -> Option<(u8, Option<u8>)> {
        match self.interface {
            Interface::Gpib { primary, secondary } => Some((primary, secondary)),
            _ => None,
        }
    }

    /// Serial ports (`ASRL`) are usually not instruments.
    pub fn is_serial(&self) -> bool {
        matches!(self.interface, Interface::Asrl { .. })
    }

    /// Get a `HandleId` based on the address. A `HandleId` maps directly to
    /// one exclusive bus resource.
    pub fn handle_id(&self) -> HandleId {
        HandleId::new(self.to_string())
    }
}

impl From<ResourceAddress> for String {
    fn from(addr: ResourceAddress) -> Self {
        addr.to_string()
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = Error;

    fn try_from(x: String) -> Result<Self, Self::Error> {
        ResourceAddress::parse(&x)
    }
}

impl FromStr for ResourceAddress {
    type Err = Error;

    fn from_str(x: &str) -> Result<Self, Self::Err> {
        ResourceAddress::parse(x)
    }
}

impl Display for ResourceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let board = self.board;
        match &self.interface {
            Interface::Gpib { primary, secondary } => match secondary {
                Some(secondary) => write!(f, "GPIB{}::{}::{}::INSTR", board, primary, secondary),
                None => write!(f, "GPIB{}::{}::INSTR", board, primary),
            },
            Interface::GpibBoard => write!(f, "GPIB{}::INTFC", board),
            Interface::Asrl { device } => match device {
                Some(device) => write!(f, "ASRL{}::INSTR", device),
                None => write!(f, "ASRL{}::INSTR", board),
            },
            Interface::TcpipInstr { host, lan_device } => match lan_device {
                Some(lan_device) => write!(f, "TCPIP{}::{}::{}::INSTR", board, host, lan_device),
                None => write!(f, "TCPIP{}::{}::INSTR", board, host),
            },
            Interface::TcpipSocket { host, port } => {
                write!(f, "TCPIP{}::{}::{}::SOCKET", board, host, port)
            }
            Interface::Usb {
                vendor,
                product,
                serial,
                interface_number,
                raw,
            } => {
                write!(f, "USB{}::0x{:04X}::0x{:04X}::{}", board, vendor, product, serial)?;
                if let Some(x) = interface_number {
                    write!(f, "::{}", x)?;
                }
                f.write_str(if *raw { "::RAW" } else { "::INSTR" })
            }
        }
    }
}

/// Represents an identifier for an exclusive bus resource; there can be only
/// one open session per handle.
#[derive(Hash, Clone, PartialEq, Eq, Debug)]
pub struct HandleId {
    inner: String,
}

impl HandleId {
    pub fn new(inner: String) -> Self {
        Self { inner }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl Display for HandleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gpib() {
        let addr = ResourceAddress::parse("GPIB0::6::INSTR").unwrap();
        assert_eq!(addr.board(), 0);
        assert_eq!(addr.gpib_address(), Some((6, None)));
        assert_eq!(addr.to_string(), "GPIB0::6::INSTR");

        let addr = ResourceAddress::parse("gpib1::22::5").unwrap();
        match addr.interface() {
            Interface::Gpib { primary, secondary } => {
                assert_eq!(*primary, 22);
                assert_eq!(*secondary, Some(5));
            }
            _ => panic!(),
        }
        assert_eq!(addr.board(), 1);
        assert_eq!(addr.to_string(), "GPIB1::22::5::INSTR");
    }

    #[test]
    fn gpib_defaults_are_normalized() {
        let addr = ResourceAddress::parse("GPIB::6").unwrap();
        assert_eq!(addr.to_string(), "GPIB0::6::INSTR");
        assert_eq!(
            addr.handle_id(),
            ResourceAddress::parse("gpib0::6::instr").unwrap().handle_id()
        );
    }

    #[test]
    fn parse_gpib_board() {
        let addr = ResourceAddress::parse("GPIB0::INTFC").unwrap();
        assert!(matches!(addr.interface(), Interface::GpibBoard));
        assert!(ResourceAddress::parse("GPIB0::6::INTFC").is_err());
    }

    #[test]
    fn reject_out_of_range_gpib() {
        assert!(ResourceAddress::parse("GPIB0::31::INSTR").is_err());
        assert!(ResourceAddress::parse("GPIB0::6::31::INSTR").is_err());
        assert!(ResourceAddress::parse("GPIB0::-1::INSTR").is_err());
        assert!(ResourceAddress::parse("GPIB0::1::2::3::INSTR").is_err());
    }

    #[test]
    fn parse_serial() {
        let addr = ResourceAddress::parse("ASRL/dev/ttyUSB0::INSTR").unwrap();
        match addr.interface() {
            Interface::Asrl { device } => assert_eq!(device.as_deref(), Some("/dev/ttyUSB0")),
            _ => panic!(),
        }
        assert!(addr.is_serial());
        assert_eq!(addr.to_string(), "ASRL/dev/ttyUSB0::INSTR");

        let addr = ResourceAddress::parse("ASRL3::INSTR").unwrap();
        assert_eq!(addr.board(), 3);
        assert_eq!(addr.to_string(), "ASRL3::INSTR");
    }

    #[test]
    fn parse_tcpip() {
        let addr = ResourceAddress::parse("TCPIP0::192.168.1.100::inst0::INSTR").unwrap();
        match addr.interface() {
            Interface::TcpipInstr { host, lan_device } => {
                assert_eq!(host, "192.168.1.100");
                assert_eq!(lan_device.as_deref(), Some("inst0"));
            }
            _ => panic!(),
        }

        let addr = ResourceAddress::parse("tcpip::10.0.0.5::5025::socket").unwrap();
        match addr.interface() {
            Interface::TcpipSocket { host, port } => {
                assert_eq!(host, "10.0.0.5");
                assert_eq!(*port, 5025);
            }
            _ => panic!(),
        }
        assert_eq!(addr.to_string(), "TCPIP0::10.0.0.5::5025::SOCKET");
        assert!(ResourceAddress::parse("TCPIP0::10.0.0.5::SOCKET").is_err());
    }

    #[test]
    fn parse_usb() {
        let addr = ResourceAddress::parse("USB0::0x1AB1::0x04CE::DS1ZA123456789::INSTR").unwrap();
        match addr.interface() {
            Interface::Usb {
                vendor,
                product,
                serial,
                interface_number,
                raw,
            } => {
                assert_eq!(*vendor, 0x1AB1);
                assert_eq!(*product, 0x04CE);
                assert_eq!(serial, "DS1ZA123456789");
                assert_eq!(*interface_number, None);
                assert!(!raw);
            }
            _ => panic!(),
        }

        let addr = ResourceAddress::parse("USB::4883::32847::M01053290::0::INSTR").unwrap();
        assert_eq!(addr.to_string(), "USB0::0x1313::0x804F::M01053290::0::INSTR");
    }

    #[test]
    fn reject_garbage() {
        for raw in [
            "not-an-address",
            "",
            "   ",
            "GPIB0::",
            "::6::INSTR",
            "GPIBX::6::INSTR",
            "GPIB0::six::INSTR",
            "VXI0::1::INSTR",
            "ASRL1::2::INSTR",
            "GPIB0::6::SOCKET",
        ] {
            match ResourceAddress::parse(raw) {
                Err(Error::InvalidAddress { address, .. }) => assert_eq!(address, raw),
                other => panic!("{:?} parsed as {:?}", raw, other),
            }
        }
    }

    #[test]
    fn serde_as_string() {
        let addr = ResourceAddress::parse("gpib0::6").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"GPIB0::6::INSTR\"");
        let back: ResourceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<ResourceAddress>("\"bogus\"").is_err());
    }
}
