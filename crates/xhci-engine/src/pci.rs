//! PCI discovery of xHCI controllers.

use core::fmt;

/// Class code of a USB xHCI host controller: serial bus / USB / xHCI programming interface.
pub const XHCI_CLASS: u8 = 0x0c;
pub const XHCI_SUBCLASS: u8 = 0x03;
pub const XHCI_PROG_IF: u8 = 0x30;

const REG_ID: u8 = 0x00;
const REG_COMMAND: u8 = 0x04;
const REG_CLASS: u8 = 0x08;
const REG_HEADER: u8 = 0x0c;
const REG_BAR0: u8 = 0x10;

const COMMAND_MEMORY_SPACE: u32 = 1 << 1;
const COMMAND_BUS_MASTER: u32 = 1 << 2;

/// PCI configuration space access.
pub trait ConfigSpace {
    /// Read a 32-bit config register; `offset` must be 4-byte aligned.
    fn read_config_dword(&mut self, addr: PciAddress, offset: u8) -> u32;

    /// Write a 32-bit config register; `offset` must be 4-byte aligned.
    fn write_config_dword(&mut self, addr: PciAddress, offset: u8, value: u32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

fn is_xhci(class_reg: u32) -> bool {
    let class = (class_reg >> 24) as u8;
    let subclass = (class_reg >> 16) as u8;
    let prog_if = (class_reg >> 8) as u8;
    class == XHCI_CLASS && subclass == XHCI_SUBCLASS && prog_if == XHCI_PROG_IF
}

/// Scans every bus, device and function for the first xHCI controller.
pub fn find_controller<C: ConfigSpace + ?Sized>(pci: &mut C) -> Option<PciAddress> {
    for bus in 0u8..=0xff {
        for device in 0u8..32 {
            for function in 0u8..8 {
                let addr = PciAddress::new(bus, device, function);
                let id = pci.read_config_dword(addr, REG_ID);
                if id & 0xffff == 0xffff {
                    if function == 0 {
                        break;
                    }
                    continue;
                }

                if is_xhci(pci.read_config_dword(addr, REG_CLASS)) {
                    return Some(addr);
                }

                if function == 0 {
                    let header_type = (pci.read_config_dword(addr, REG_HEADER) >> 16) as u8;
                    if header_type & 0x80 == 0 {
                        break;
                    }
                }
            }
        }
    }
    None
}

/// Decodes BAR0 as a memory BAR (32- or 64-bit). Returns `None` for I/O BARs or an unassigned
/// (zero) address.
pub fn read_bar0<C: ConfigSpace + ?Sized>(pci: &mut C, addr: PciAddress) -> Option<u64> {
    let lo = pci.read_config_dword(addr, REG_BAR0);
    if lo & 0x1 != 0 {
        return None;
    }
    let mut base = u64::from(lo & !0xf);
    // Type bits 2:1 == 0b10: 64-bit BAR, high half in BAR1.
    if (lo >> 1) & 0x3 == 0x2 {
        let hi = pci.read_config_dword(addr, REG_BAR0 + 4);
        base |= u64::from(hi) << 32;
    }
    (base != 0).then_some(base)
}

pub fn enable_mmio_and_bus_master<C: ConfigSpace + ?Sized>(pci: &mut C, addr: PciAddress) {
    let cmd = pci.read_config_dword(addr, REG_COMMAND);
    // Only the low 16 bits are the command register; keep status (RW1C) bits clear.
    let cmd = (cmd & 0xffff) | COMMAND_MEMORY_SPACE | COMMAND_BUS_MASTER;
    pci.write_config_dword(addr, REG_COMMAND, cmd);
}
