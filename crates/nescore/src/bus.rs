//! NES System Bus Implementation.
//!
//! The bus connects the CPU to all other components:
//! - PPU registers ($2000-$2007, mirrored every 8 bytes to $3FFF)
//! - Controller ports ($4016-$4017)
//! - Cartridge SRAM ($6000-$7FFF)
//! - Cartridge PRG space ($8000-$FFFF)
//! - Internal RAM ($0000-$07FF, mirrored to $1FFF)
//!
//! `$4020-$5FFF` is unassigned on a standard NROM cartridge; accessing it is
//! a fatal condition for the current machine, recorded as a [`BusFault`]
//! rather than panicking the host process.

use nescore_cpu::Bus;
use nescore_mappers::{Mapper, Mirroring};
use nescore_ppu::Ppu;

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

/// Controller input state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerState {
    /// Button states: A, B, Select, Start, Up, Down, Left, Right.
    pub buttons: u8,
}

impl ControllerState {
    /// A button mask.
    pub const A: u8 = 0x80;
    /// B button mask.
    pub const B: u8 = 0x40;
    /// Select button mask.
    pub const SELECT: u8 = 0x20;
    /// Start button mask.
    pub const START: u8 = 0x10;
    /// Up button mask.
    pub const UP: u8 = 0x08;
    /// Down button mask.
    pub const DOWN: u8 = 0x04;
    /// Left button mask.
    pub const LEFT: u8 = 0x02;
    /// Right button mask.
    pub const RIGHT: u8 = 0x01;
}

/// A fatal, unrecoverable bus access recorded instead of panicking the host
/// process. The driving `Machine` surfaces this to its caller and stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault {
    /// Address that triggered the fault.
    pub addr: u16,
    /// True if the fault was a write, false if a read.
    pub is_write: bool,
}

/// PPU memory bus adapter for CHR and CIRAM access.
///
/// This wrapper allows the PPU to access CHR memory through the mapper
/// and nametable memory (CIRAM) with proper mirroring.
///
/// NES PPU memory map, as seen through this adapter:
/// - $0000-$1FFF: Pattern tables (CHR ROM/RAM, handled by mapper)
/// - $2000-$3EFF: Nametables (2KB CIRAM with mirroring)
///
/// `$3F00-$3FFF` (palette RAM) never reaches this adapter; the PPU itself
/// intercepts that range before calling out to the bus.
pub struct PpuMemory<'a> {
    mapper: &'a mut dyn Mapper,
    ciram: &'a mut [u8; 2048],
    mirroring: Mirroring,
}

impl PpuMemory<'_> {
    /// Calculate the CIRAM address with nametable mirroring applied.
    ///
    /// The NES has 2KB of internal VRAM (CIRAM) for nametables, but the
    /// nametable address space is 4KB ($2000-$2FFF). The mirroring mode
    /// determines how the 4 logical nametables map to the 2 physical ones.
    fn ciram_addr(&self, addr: u16) -> usize {
        // Mask to get offset within nametable region ($0000-$0FFF)
        let addr = addr & 0x0FFF;

        match self.mirroring {
            Mirroring::Horizontal => {
                let nametable = (addr >> 11) & 1;
                let offset = addr & 0x03FF;
                (nametable * 0x400 + offset) as usize
            }
            Mirroring::Vertical => {
                let nametable = (addr >> 10) & 1;
                let offset = addr & 0x03FF;
                (nametable * 0x400 + offset) as usize
            }
            Mirroring::SingleScreenLower => (addr & 0x03FF) as usize,
            Mirroring::SingleScreenUpper => ((addr & 0x03FF) + 0x400) as usize,
            Mirroring::FourScreen => {
                // No extra CIRAM is wired up for four-screen carts; fall back
                // to vertical mirroring rather than indexing out of bounds.
                let nametable = (addr >> 10) & 1;
                let offset = addr & 0x03FF;
                (nametable * 0x400 + offset) as usize
            }
        }
    }
}

impl nescore_ppu::PpuBus for PpuMemory<'_> {
    fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.mapper.read_chr(addr),
            0x2000..=0x3EFF => {
                let ciram_addr = self.ciram_addr(addr);
                self.ciram[ciram_addr]
            }
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => self.mapper.write_chr(addr, value),
            0x2000..=0x3EFF => {
                let ciram_addr = self.ciram_addr(addr);
                self.ciram[ciram_addr] = value;
            }
            _ => {}
        }
    }
}

/// NES system bus connecting all components.
pub struct NesBus {
    /// Internal RAM (2KB, mirrored 4 times).
    pub ram: [u8; 2048],
    /// PPU internal VRAM (CIRAM, 2KB) for nametables.
    pub ciram: [u8; 2048],
    /// PPU (Picture Processing Unit).
    pub ppu: Ppu,
    /// Cartridge SRAM ($6000-$7FFF), present even when the mapper has no
    /// battery backing for it.
    pub sram: [u8; 0x2000],
    /// Cartridge mapper.
    pub mapper: Box<dyn Mapper>,
    /// Controller 1 state.
    pub controller1: ControllerState,
    /// Controller 2 state.
    pub controller2: ControllerState,
    /// Controller 1 shift register.
    controller1_shift: u8,
    /// Controller 2 shift register.
    controller2_shift: u8,
    /// Controller strobe latch.
    controller_strobe: bool,
    /// OAM DMA page.
    oam_dma_page: Option<u8>,
    /// CPU cycle counter for DMA timing.
    cpu_cycles: u64,
    /// Last value on the data bus (for open bus behavior).
    last_bus_value: u8,
    /// NMI pending from PPU.
    nmi_pending: bool,
    /// IRQ pending from mapper.
    irq_pending: bool,
    /// Set the first time an access lands in the unmapped `$4020-$5FFF`
    /// region. `Machine::step` checks this after every bus access and turns
    /// it into a fatal error for the caller.
    fault: Option<BusFault>,
}

impl NesBus {
    /// Create a new NES bus with the given mapper.
    #[must_use]
    pub fn new(mapper: Box<dyn Mapper>) -> Self {
        Self {
            ram: [0; 2048],
            ciram: [0; 2048],
            ppu: Ppu::new(),
            sram: [0; 0x2000],
            mapper,
            controller1: ControllerState::default(),
            controller2: ControllerState::default(),
            controller1_shift: 0,
            controller2_shift: 0,
            controller_strobe: false,
            oam_dma_page: None,
            cpu_cycles: 0,
            last_bus_value: 0,
            nmi_pending: false,
            irq_pending: false,
            fault: None,
        }
    }

    /// Reset the bus and all components.
    pub fn reset(&mut self) {
        self.ram.fill(0);
        self.ciram.fill(0);
        self.ppu.reset();
        self.mapper.reset();
        self.controller1_shift = 0;
        self.controller2_shift = 0;
        self.controller_strobe = false;
        self.oam_dma_page = None;
        self.cpu_cycles = 0;
        self.last_bus_value = 0;
        self.nmi_pending = false;
        self.irq_pending = false;
        self.fault = None;
    }

    /// Check if OAM DMA is pending.
    #[must_use]
    pub fn oam_dma_pending(&self) -> bool {
        self.oam_dma_page.is_some()
    }

    /// Execute OAM DMA transfer.
    ///
    /// Returns the number of CPU cycles consumed.
    pub fn execute_oam_dma(&mut self) -> u16 {
        if let Some(page) = self.oam_dma_page.take() {
            let base = u16::from(page) << 8;

            for i in 0..256u16 {
                let addr = base.wrapping_add(i);
                let data = self.cpu_read(addr);
                self.ppu.oam_dma_write(data);
            }

            // DMA takes 513 or 514 cycles depending on CPU cycle parity.
            let cycles = if self.cpu_cycles % 2 == 1 { 514 } else { 513 };
            self.cpu_cycles += u64::from(cycles);
            cycles
        } else {
            0
        }
    }

    /// Internal CPU read without updating bus state (for DMA source reads).
    fn cpu_read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],
            0x6000..=0x7FFF => self.sram[(addr - 0x6000) as usize],
            0x8000..=0xFFFF => self.mapper.read_prg(addr),
            _ => 0,
        }
    }

    /// Step the PPU by 3 dots (one CPU cycle worth).
    ///
    /// Returns true if NMI should be triggered.
    pub fn step_ppu(&mut self) -> bool {
        let mut nmi = false;

        for _ in 0..3 {
            let mirroring = self.mapper.mirroring();
            let mut ppu_mem = PpuMemory {
                mapper: &mut *self.mapper,
                ciram: &mut self.ciram,
                mirroring,
            };
            let event = self.ppu.step(&mut ppu_mem);
            if event.nmi {
                nmi = true;
            }
        }

        self.mapper.clock(1);

        if nmi {
            self.nmi_pending = true;
        }

        nmi
    }

    /// Check if NMI is pending.
    #[must_use]
    pub fn nmi_pending(&self) -> bool {
        self.nmi_pending
    }

    /// Acknowledge NMI.
    pub fn acknowledge_nmi(&mut self) {
        self.nmi_pending = false;
    }

    /// Check if IRQ is pending.
    #[must_use]
    pub fn irq_pending(&self) -> bool {
        self.irq_pending || self.mapper.irq_pending()
    }

    /// Acknowledge mapper IRQ.
    pub fn acknowledge_mapper_irq(&mut self) {
        self.mapper.irq_acknowledge();
    }

    /// Get the current CPU cycle count.
    #[must_use]
    pub fn cpu_cycles(&self) -> u64 {
        self.cpu_cycles
    }

    /// Increment CPU cycle count.
    pub fn add_cpu_cycles(&mut self, cycles: u8) {
        self.cpu_cycles += u64::from(cycles);
    }

    /// Take and clear any recorded bus fault.
    pub fn take_fault(&mut self) -> Option<BusFault> {
        self.fault.take()
    }

    fn record_fault(&mut self, addr: u16, is_write: bool) {
        log::warn!(
            "access to unmapped cartridge expansion region ${addr:04X} ({})",
            if is_write { "write" } else { "read" }
        );
        self.fault.get_or_insert(BusFault { addr, is_write });
    }

    /// Read controller register, MSB-first out of the shift register.
    fn read_controller(&mut self, port: u8) -> u8 {
        let shift = if port == 0 {
            &mut self.controller1_shift
        } else {
            &mut self.controller2_shift
        };

        // Open bus behavior: bits 5-7 come from last bus value.
        let open_bus = self.last_bus_value & 0xE0;

        // While strobe is held high, every read returns the current A bit
        // without advancing the shift register.
        if self.controller_strobe {
            return ((*shift >> 7) & 1) | open_bus;
        }

        let data = ((*shift >> 7) & 1) | open_bus;
        *shift <<= 1;
        *shift |= 1; // Shift in 1s after all buttons are read.

        data
    }

    /// Write controller strobe.
    fn write_controller_strobe(&mut self, val: u8) {
        let new_strobe = val & 1 != 0;

        // On falling edge (strobe 1->0), latch controller state.
        if self.controller_strobe && !new_strobe {
            self.controller1_shift = self.controller1.buttons;
            self.controller2_shift = self.controller2.buttons;
        }

        self.controller_strobe = new_strobe;

        // While strobe is high, continuously reload.
        if self.controller_strobe {
            self.controller1_shift = self.controller1.buttons;
            self.controller2_shift = self.controller2.buttons;
        }
    }

    /// Peek at memory without side effects.
    ///
    /// This is useful for debugging/display purposes where we don't want
    /// to trigger PPU register side effects or mapper state changes.
    #[must_use]
    pub fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],
            0x2000..=0x3FFF => self.last_bus_value,
            0x4000..=0x4015 | 0x4018..=0x401F => self.last_bus_value,
            0x4016 | 0x4017 => self.last_bus_value,
            0x4020..=0x5FFF => self.last_bus_value,
            0x6000..=0x7FFF => self.sram[(addr - 0x6000) as usize],
            0x8000..=0xFFFF => self.mapper.read_prg(addr),
        }
    }
}

/// CPU bus implementation.
impl Bus for NesBus {
    fn read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            // Internal RAM (mirrored every 2KB)
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],

            // PPU registers (mirrored every 8 bytes)
            0x2000..=0x3FFF => {
                let mirroring = self.mapper.mirroring();
                let mut ppu_mem = PpuMemory {
                    mapper: &mut *self.mapper,
                    ciram: &mut self.ciram,
                    mirroring,
                };
                self.ppu.read_register(addr, &mut ppu_mem)
            }

            // Controller ports
            0x4016 => self.read_controller(0),
            0x4017 => self.read_controller(1),

            // Unused APU/IO range; no APU in this core.
            0x4000..=0x4015 | 0x4018..=0x401F => self.last_bus_value,

            // Unassigned cartridge expansion space.
            0x4020..=0x5FFF => {
                self.record_fault(addr, false);
                self.last_bus_value
            }

            // Cartridge SRAM
            0x6000..=0x7FFF => self.sram[(addr - 0x6000) as usize],

            // Cartridge PRG-ROM/RAM
            0x8000..=0xFFFF => self.mapper.read_prg(addr),
        };

        self.last_bus_value = value;
        value
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.last_bus_value = val;

        match addr {
            0x0000..=0x1FFF => {
                self.ram[(addr & 0x07FF) as usize] = val;
            }

            0x2000..=0x3FFF => {
                let mirroring = self.mapper.mirroring();
                let mut ppu_mem = PpuMemory {
                    mapper: &mut *self.mapper,
                    ciram: &mut self.ciram,
                    mirroring,
                };
                if self.ppu.write_register(addr, val, &mut ppu_mem) {
                    self.nmi_pending = true;
                }
            }

            0x4014 => {
                self.oam_dma_page = Some(val);
            }

            0x4016 => {
                self.write_controller_strobe(val);
            }

            // Unused APU/IO range; no APU in this core.
            0x4000..=0x4015 | 0x4017..=0x401F => {}

            0x4020..=0x5FFF => {
                self.record_fault(addr, true);
            }

            0x6000..=0x7FFF => {
                self.sram[(addr - 0x6000) as usize] = val;
            }

            0x8000..=0xFFFF => {
                log::warn!("write to PRG-ROM ignored: ${addr:04X}");
                self.mapper.write_prg(addr, val);
            }
        }
    }

    fn peek(&self, addr: u16) -> u8 {
        NesBus::peek(self, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nescore_mappers::{Mirroring, Nrom, Rom, RomHeader};

    #[cfg(not(feature = "std"))]
    use alloc::{boxed::Box, vec, vec::Vec};

    fn create_test_bus() -> NesBus {
        let rom = Rom {
            header: RomHeader {
                prg_rom_size: 32768,
                chr_rom_size: 8192,
                mapper_number: 0,
                submapper: 0,
                mirroring: Mirroring::Vertical,
                has_battery: false,
                has_trainer: false,
                nes2_format: false,
                prg_ram_size: 8192,
                prg_nvram_size: 0,
                chr_ram_size: 0,
                chr_nvram_size: 0,
            },
            prg_rom: vec![0; 32768],
            chr_rom: vec![0; 8192],
            trainer: None,
        };
        NesBus::new(Box::new(Nrom::new(&rom)))
    }

    #[test]
    fn test_ram_mirroring() {
        let mut bus = create_test_bus();

        Bus::write(&mut bus, 0x0000, 0x42);
        assert_eq!(Bus::read(&mut bus, 0x0000), 0x42);

        assert_eq!(Bus::read(&mut bus, 0x0800), 0x42);
        assert_eq!(Bus::read(&mut bus, 0x1000), 0x42);
        assert_eq!(Bus::read(&mut bus, 0x1800), 0x42);

        Bus::write(&mut bus, 0x1234, 0xAB);
        assert_eq!(Bus::read(&mut bus, 0x0234), 0xAB); // $1234 & $07FF = $0234
    }

    #[test]
    fn test_sram_round_trip() {
        let mut bus = create_test_bus();

        Bus::write(&mut bus, 0x6000, 0x55);
        Bus::write(&mut bus, 0x7FFF, 0xAA);

        assert_eq!(Bus::read(&mut bus, 0x6000), 0x55);
        assert_eq!(Bus::read(&mut bus, 0x7FFF), 0xAA);
    }

    #[test]
    fn test_unmapped_region_faults() {
        let mut bus = create_test_bus();

        assert!(bus.take_fault().is_none());
        let _ = Bus::read(&mut bus, 0x4800);
        let fault = bus.take_fault().expect("access to $4020-$5FFF must fault");
        assert_eq!(fault.addr, 0x4800);
        assert!(!fault.is_write);

        // Taking the fault clears it.
        assert!(bus.take_fault().is_none());
    }

    #[test]
    fn test_controller_strobe() {
        let mut bus = create_test_bus();

        // A, Select, Down, Right pressed (MSB-first bit order).
        bus.controller1.buttons =
            ControllerState::A | ControllerState::SELECT | ControllerState::DOWN | ControllerState::RIGHT;

        Bus::write(&mut bus, 0x4016, 1);
        Bus::write(&mut bus, 0x4016, 0);

        assert_eq!(Bus::read(&mut bus, 0x4016) & 1, 1); // A
        assert_eq!(Bus::read(&mut bus, 0x4016) & 1, 0); // B
        assert_eq!(Bus::read(&mut bus, 0x4016) & 1, 1); // Select
        assert_eq!(Bus::read(&mut bus, 0x4016) & 1, 0); // Start
        assert_eq!(Bus::read(&mut bus, 0x4016) & 1, 0); // Up
        assert_eq!(Bus::read(&mut bus, 0x4016) & 1, 1); // Down
        assert_eq!(Bus::read(&mut bus, 0x4016) & 1, 0); // Left
        assert_eq!(Bus::read(&mut bus, 0x4016) & 1, 1); // Right
    }

    #[test]
    fn test_oam_dma() {
        let mut bus = create_test_bus();

        for i in 0..256 {
            Bus::write(&mut bus, 0x0200 + i, i as u8);
        }

        Bus::write(&mut bus, 0x4014, 0x02);
        assert!(bus.oam_dma_pending());

        let cycles = bus.execute_oam_dma();
        assert!(!bus.oam_dma_pending());
        assert!(cycles == 513 || cycles == 514);
    }

    #[test]
    fn test_open_bus_behavior() {
        let mut bus = create_test_bus();

        Bus::write(&mut bus, 0x0000, 0xAB);
        let _ = Bus::read(&mut bus, 0x0000);

        assert_eq!(bus.last_bus_value, 0xAB);
    }

    #[test]
    fn test_peek_memory() {
        let mut bus = create_test_bus();

        Bus::write(&mut bus, 0x0100, 0x42);

        assert_eq!(bus.peek(0x0100), 0x42);
        assert_eq!(bus.peek(0x0900), 0x42);
    }

    #[test]
    fn test_reset() {
        let mut bus = create_test_bus();
        bus.nmi_pending = true;

        bus.reset();

        assert_eq!(Bus::read(&mut bus, 0x0000), 0);
        assert_eq!(bus.cpu_cycles, 0);
        assert!(!bus.nmi_pending);
    }
}
