use alloc::collections::VecDeque;
use alloc::string::String;
use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;

/// Register block of a 16550-compatible UART (byte stride, as on QEMU `virt`).
#[repr(C)]
struct UartRegisters {
    data: Volatile<u8>,
    int_en: Volatile<u8>,
    fifo_ctrl: Volatile<u8>,
    line_ctrl: Volatile<u8>,
    modem_ctrl: Volatile<u8>,
    line_sts: Volatile<u8>,
}

pub struct SerialPort {
    regs: &'static mut UartRegisters,
}

impl SerialPort {
    /// # Safety
    /// `base` must be the MMIO base of a 16550 UART that nothing else drives.
    pub unsafe fn new(base: usize) -> SerialPort {
        SerialPort {
            regs: &mut *(base as *mut UartRegisters),
        }
    }

    pub fn init(&mut self) {
        self.regs.int_en.write(0x00);
        // DLAB on, divisor 3 (38400 baud), then 8N1.
        self.regs.line_ctrl.write(0x80);
        self.regs.data.write(0x03);
        self.regs.int_en.write(0x00);
        self.regs.line_ctrl.write(0x03);
        self.regs.fifo_ctrl.write(0x07);
        self.regs.modem_ctrl.write(0x0B);
        self.regs.int_en.write(0x01);
    }

    fn wait_for_tx_empty(&mut self) {
        while (self.regs.line_sts.read() & 0x20) == 0 {
            core::hint::spin_loop();
        }
    }

    pub fn send(&mut self, data: u8) {
        self.wait_for_tx_empty();
        self.regs.data.write(data);
    }

    #[allow(dead_code)]
    fn open() -> SerialPort {
        let mut port = unsafe { SerialPort::new(crate::config::UART0_BASE) };
        port.init();
        port
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

const LOG_CAPACITY: usize = 64 * 1024;

/// In-memory console used when there is no UART to drive (hosted builds).
/// Keeps the most recent `capacity` bytes.
pub struct LogBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        LogBuffer {
            bytes: VecDeque::new(),
            capacity,
        }
    }

    pub fn contents(&self) -> String {
        let (head, tail) = self.bytes.as_slices();
        let mut out = String::from_utf8_lossy(head).into_owned();
        out.push_str(&String::from_utf8_lossy(tail));
        out
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[allow(dead_code)]
    fn open() -> LogBuffer {
        LogBuffer::new(LOG_CAPACITY)
    }
}

impl core::fmt::Write for LogBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &byte in s.as_bytes() {
            if self.bytes.len() == self.capacity {
                self.bytes.pop_front();
            }
            self.bytes.push_back(byte);
        }
        Ok(())
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub type Console = SerialPort;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub type Console = LogBuffer;

lazy_static! {
    pub static ref SERIAL1: Mutex<Console> = Mutex::new(Console::open());
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    SERIAL1.lock().write_fmt(args).expect("Printing to serial failed");
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[INFO] {}\n", format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[WARN] {}\n", format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[ERROR] {}\n", format_args!($($arg)*)))
    };
}

pub fn init() {
    let _ = SERIAL1.lock();
}
