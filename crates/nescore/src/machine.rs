//! NES Machine Implementation.
//!
//! `Machine` owns the CPU, bus, PPU, and mapper by value and drives them
//! through a single `step`/`step_frame` entry point — no component holds a
//! back-pointer to another, so there is no cycle to untangle when building
//! or dropping one.

use crate::bus::{BusFault, ControllerState, NesBus};
use nescore_cpu::Cpu;
use nescore_mappers::{Mapper, Rom, RomError, create_mapper};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec, vec::Vec};

/// NES emulation timing constants.
pub mod timing {
    /// Master clock frequency (NTSC).
    pub const MASTER_CLOCK_NTSC: u32 = 21_477_272;
    /// CPU clock frequency (NTSC).
    pub const CPU_CLOCK_NTSC: u32 = MASTER_CLOCK_NTSC / 12;
    /// PPU clock frequency (NTSC).
    pub const PPU_CLOCK_NTSC: u32 = MASTER_CLOCK_NTSC / 4;
    /// CPU cycles per frame (NTSC).
    pub const CPU_CYCLES_PER_FRAME: u32 = 29_780;
    /// PPU dots per scanline.
    pub const PPU_DOTS_PER_SCANLINE: u16 = 341;
    /// Total scanlines (including vblank).
    pub const PPU_SCANLINES: u16 = 262;
    /// Target frame rate (NTSC).
    pub const FRAME_RATE_NTSC: f64 = 60.0988;
}

/// Machine error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MachineError {
    /// ROM loading or mapper-creation error.
    #[error("ROM error: {0}")]
    Rom(#[from] RomError),
    /// A CPU bus access landed in the unmapped `$4020-$5FFF` region.
    #[error("invalid address ${:04X} ({})", .0.addr, if .0.is_write { "write" } else { "read" })]
    InvalidAddress(BusFault),
}

/// NES console emulator.
///
/// Owns the CPU, the system bus (which in turn owns the PPU and mapper),
/// and the RGBA framebuffer presented to the driver.
pub struct Machine {
    cpu: Cpu,
    bus: NesBus,
    framebuffer: Vec<u8>,
    total_cycles: u64,
    frame_count: u64,
    running: bool,
}

impl Machine {
    /// Create a new machine with the given ROM.
    ///
    /// # Errors
    ///
    /// Returns an error if the ROM cannot be loaded or uses an unsupported mapper.
    pub fn new(rom_data: &[u8]) -> Result<Self, MachineError> {
        let rom = Rom::load(rom_data)?;
        let mapper = create_mapper(&rom)?;
        Ok(Self::with_mapper(mapper))
    }

    /// Create a new machine from ROM bytes (alias for [`Machine::new`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the ROM cannot be loaded or uses an unsupported mapper.
    pub fn from_rom_bytes(rom_data: &[u8]) -> Result<Self, MachineError> {
        Self::new(rom_data)
    }

    /// Create a machine with a pre-created mapper.
    #[must_use]
    pub fn with_mapper(mapper: Box<dyn Mapper>) -> Self {
        let bus = NesBus::new(mapper);
        let cpu = Cpu::new();

        Self {
            cpu,
            bus,
            framebuffer: vec![0; 256 * 240 * 4],
            total_cycles: 0,
            frame_count: 0,
            running: true,
        }
    }

    /// Reset the machine to initial state, as a power cycle would.
    pub fn reset(&mut self) {
        self.cpu.reset(&mut self.bus);
        self.bus.reset();
        self.total_cycles = 0;
        self.running = true;
    }

    /// Reset but force the program counter to `pc` instead of reading the
    /// reset vector. Used by test harnesses that boot execution at a fixed
    /// address (e.g. nestest's `$C000` entry point).
    pub fn reset_to(&mut self, pc: u16) {
        self.cpu.reset_to(pc);
        self.bus.reset();
        self.total_cycles = 0;
        self.running = true;
    }

    /// Power on the machine (cold boot).
    pub fn power_on(&mut self) {
        self.reset();
    }

    /// Run emulation for one CPU instruction.
    ///
    /// Returns the number of CPU cycles executed.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::InvalidAddress`] if the instruction touched
    /// the unmapped `$4020-$5FFF` cartridge expansion region; the machine
    /// stops running and further calls return 0 until [`Machine::reset`].
    pub fn step(&mut self) -> Result<u8, MachineError> {
        if !self.running {
            return Ok(0);
        }

        if self.bus.oam_dma_pending() {
            let dma_cycles = self.bus.execute_oam_dma();
            self.step_ppu_for(dma_cycles);
            return Ok(dma_cycles as u8);
        }

        if self.bus.nmi_pending() {
            self.bus.acknowledge_nmi();
            self.cpu.request_nmi();
        }
        self.cpu
            .set_irq_line(self.bus.irq_pending() && !self.cpu.status().contains(nescore_cpu::Status::I));

        let cycles = self.cpu.step(&mut self.bus);
        self.step_ppu_for(u16::from(cycles));
        self.bus.add_cpu_cycles(cycles);
        self.total_cycles += u64::from(cycles);

        if let Some(fault) = self.bus.take_fault() {
            self.running = false;
            return Err(MachineError::InvalidAddress(fault));
        }

        Ok(cycles)
    }

    /// Step the PPU (and mapper clock) for the given number of CPU cycles.
    fn step_ppu_for(&mut self, cpu_cycles: u16) {
        for _ in 0..cpu_cycles {
            self.bus.step_ppu();
        }
    }

    /// Run emulation for one frame (approximately 29,780 CPU cycles).
    ///
    /// Returns the actual number of CPU cycles executed.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::InvalidAddress`] under the same condition as
    /// [`Machine::step`].
    pub fn step_frame(&mut self) -> Result<u64, MachineError> {
        let start_cycles = self.total_cycles;
        let target_cycles = self.total_cycles + u64::from(timing::CPU_CYCLES_PER_FRAME);

        while self.total_cycles < target_cycles && self.running {
            self.step()?;
        }

        self.update_framebuffer();
        self.frame_count += 1;

        Ok(self.total_cycles - start_cycles)
    }

    /// Update the RGBA framebuffer from the PPU's rasterized frame.
    fn update_framebuffer(&mut self) {
        for (i, &(r, g, b)) in self.bus.ppu.frame_buffer().iter().enumerate() {
            let offset = i * 4;
            self.framebuffer[offset] = r;
            self.framebuffer[offset + 1] = g;
            self.framebuffer[offset + 2] = b;
            self.framebuffer[offset + 3] = 255;
        }
    }

    /// Get the current framebuffer (256x240 RGBA).
    #[must_use]
    pub fn framebuffer(&self) -> &[u8] {
        &self.framebuffer
    }

    /// Set controller 1 state from a button byte (MSB-first: A=0x80 ... Right=0x01).
    pub fn set_controller_1(&mut self, buttons: u8) {
        self.bus.controller1 = ControllerState { buttons };
    }

    /// Set controller 2 state from a button byte.
    pub fn set_controller_2(&mut self, buttons: u8) {
        self.bus.controller2 = ControllerState { buttons };
    }

    /// Set controller 1 state.
    pub fn set_controller1(&mut self, state: ControllerState) {
        self.bus.controller1 = state;
    }

    /// Set controller 2 state.
    pub fn set_controller2(&mut self, state: ControllerState) {
        self.bus.controller2 = state;
    }

    /// Get controller 1 state.
    #[must_use]
    pub fn controller1(&self) -> ControllerState {
        self.bus.controller1
    }

    /// Get controller 2 state.
    #[must_use]
    pub fn controller2(&self) -> ControllerState {
        self.bus.controller2
    }

    /// Get the total CPU cycles executed.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Get the frame count.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Check if emulation is running (cleared once a [`MachineError`] has
    /// been raised, until the next reset).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Pause emulation.
    pub fn pause(&mut self) {
        self.running = false;
    }

    /// Resume emulation.
    pub fn resume(&mut self) {
        self.running = true;
    }

    /// Get a reference to the CPU for debugging.
    #[must_use]
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Get a reference to the PPU for debugging.
    #[must_use]
    pub fn ppu(&self) -> &nescore_ppu::Ppu {
        &self.bus.ppu
    }

    /// Get the total CPU cycles (alias for [`Machine::total_cycles`]).
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Peek at memory without side effects.
    ///
    /// Useful for debugging/display purposes where we don't want to trigger
    /// PPU register side effects or mapper state changes.
    #[must_use]
    pub fn peek_memory(&self, addr: u16) -> u8 {
        self.bus.peek(addr)
    }

    /// Get a reference to the bus for debugging.
    #[must_use]
    pub fn bus(&self) -> &NesBus {
        &self.bus
    }

    /// Get a mutable reference to the bus.
    pub fn bus_mut(&mut self) -> &mut NesBus {
        &mut self.bus
    }

    /// Get the mapper number.
    #[must_use]
    pub fn mapper_number(&self) -> u16 {
        self.bus.mapper.mapper_number()
    }

    /// Get the mapper name.
    #[must_use]
    pub fn mapper_name(&self) -> &'static str {
        self.bus.mapper.mapper_name()
    }

    /// Check if the ROM has battery-backed RAM.
    #[must_use]
    pub fn has_battery(&self) -> bool {
        self.bus.mapper.has_battery()
    }

    /// Get battery-backed RAM for saving.
    #[must_use]
    pub fn battery_ram(&self) -> Option<&[u8]> {
        self.bus.mapper.battery_ram()
    }

    /// Load battery-backed RAM.
    pub fn load_battery_ram(&mut self, data: &[u8]) {
        self.bus.mapper.set_battery_ram(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nescore_mappers::{Mirroring, Nrom, RomHeader};

    #[cfg(not(feature = "std"))]
    use alloc::{boxed::Box, vec, vec::Vec};

    fn create_test_machine() -> Machine {
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
            prg_rom: {
                let mut prg = vec![0xEA; 32768]; // Fill with NOPs
                // Reset vector at $FFFC points to $8000
                prg[0x7FFC] = 0x00;
                prg[0x7FFD] = 0x80;
                prg
            },
            chr_rom: vec![0; 8192],
            trainer: None,
        };
        Machine::with_mapper(Box::new(Nrom::new(&rom)))
    }

    #[test]
    fn test_machine_creation() {
        let machine = create_test_machine();
        assert_eq!(machine.mapper_number(), 0);
        assert_eq!(machine.mapper_name(), "NROM");
    }

    #[test]
    fn test_machine_step() {
        let mut machine = create_test_machine();
        machine.reset();

        let cycles = machine.step().unwrap();
        assert!(cycles > 0);
        assert!(machine.total_cycles() > 0);
    }

    #[test]
    fn test_machine_framebuffer() {
        let machine = create_test_machine();
        let fb = machine.framebuffer();
        assert_eq!(fb.len(), 256 * 240 * 4);
    }

    #[test]
    fn test_machine_pause_resume() {
        let mut machine = create_test_machine();
        assert!(machine.is_running());

        machine.pause();
        assert!(!machine.is_running());

        machine.resume();
        assert!(machine.is_running());
    }

    #[test]
    fn test_controller_state() {
        let mut machine = create_test_machine();

        let state = ControllerState {
            buttons: ControllerState::A | ControllerState::START,
        };
        machine.set_controller1(state);

        assert_eq!(machine.controller1().buttons, 0x90);
    }

    #[test]
    fn test_machine_reset() {
        let mut machine = create_test_machine();

        for _ in 0..100 {
            machine.step().unwrap();
        }

        let cycles_before = machine.total_cycles();
        assert!(cycles_before > 0);

        machine.reset();
        assert_eq!(machine.total_cycles(), 0);
    }

    #[test]
    fn test_invalid_address_stops_machine() {
        let mut prg = vec![0xEAu8; 32768];
        // LDA #$00 ; STA $5000 (pokes the unmapped expansion region)
        prg[0..5].copy_from_slice(&[0xA9, 0x00, 0x8D, 0x00, 0x50]);
        prg[0x7FFC] = 0x00;
        prg[0x7FFD] = 0x80;

        let rom = Rom {
            header: RomHeader {
                prg_rom_size: prg.len(),
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
            prg_rom: prg,
            chr_rom: vec![0; 8192],
            trainer: None,
        };
        let mut machine = Machine::with_mapper(Box::new(Nrom::new(&rom)));
        machine.reset_to(0x8000);

        machine.step().unwrap(); // LDA #$00
        let result = machine.step(); // STA $5000
        assert!(matches!(result, Err(MachineError::InvalidAddress(_))));
        assert!(!machine.is_running());
    }
}
