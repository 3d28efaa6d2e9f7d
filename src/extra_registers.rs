use crate::kernel_abi::SupportedArch;

/// Size of a legacy fxsave area; an xsave area is always at least this much
/// plus the 64-byte xsave header.
pub const FXSAVE_SIZE: usize = 512;
pub const XSAVE_HEADER_SIZE: usize = 64;

/// Format tag for the extra-register block of a trace frame.
///
/// The data always uses the recording CPU's native XSAVE layout; the layout
/// itself is recorded in the trace's generic stream so a reader on a
/// different CPU can validate compatibility.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Format {
    None,
    FxSave,
    XSave,
}

impl Format {
    pub fn from_u8(b: u8) -> Option<Format> {
        match b {
            0 => Some(Format::None),
            1 => Some(Format::FxSave),
            2 => Some(Format::XSave),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Format::None => 0,
            Format::FxSave => 1,
            Format::XSave => 2,
        }
    }
}

/// x87/SSE/AVX state as saved by (f)xsave, recorded verbatim.
#[derive(Clone)]
pub struct ExtraRegisters {
    format_: Format,
    arch_: SupportedArch,
    data_: Vec<u8>,
}

impl Default for ExtraRegisters {
    fn default() -> Self {
        ExtraRegisters::new(crate::kernel_abi::NATIVE_ARCH)
    }
}

impl ExtraRegisters {
    pub fn new(arch: SupportedArch) -> ExtraRegisters {
        ExtraRegisters {
            format_: Format::None,
            arch_: arch,
            data_: Vec::new(),
        }
    }

    pub fn format(&self) -> Format {
        self.format_
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn data_size(&self) -> usize {
        self.data_.len()
    }

    pub fn data_bytes(&self) -> &[u8] {
        &self.data_
    }

    pub fn is_empty(&self) -> bool {
        self.data_.is_empty()
    }

    /// Set values from raw data. Returns false when the length is not
    /// plausible for the claimed format; the caller treats that as trace
    /// corruption.
    pub fn set_to_raw_data(&mut self, arch: SupportedArch, format: Format, data: Vec<u8>) -> bool {
        match format {
            Format::None => {
                if !data.is_empty() {
                    return false;
                }
            }
            Format::FxSave => {
                if data.len() != FXSAVE_SIZE {
                    return false;
                }
            }
            Format::XSave => {
                if data.len() < FXSAVE_SIZE + XSAVE_HEADER_SIZE {
                    return false;
                }
            }
        }
        self.arch_ = arch;
        self.format_ = format;
        self.data_ = data;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_byte_roundtrip() {
        for &f in &[Format::None, Format::FxSave, Format::XSave] {
            assert_eq!(Format::from_u8(f.as_u8()), Some(f));
        }
        assert_eq!(Format::from_u8(9), None);
    }

    #[test]
    fn size_validation() {
        let mut er = ExtraRegisters::new(SupportedArch::X64);
        assert!(!er.set_to_raw_data(SupportedArch::X64, Format::FxSave, vec![0; 100]));
        assert!(er.set_to_raw_data(SupportedArch::X64, Format::FxSave, vec![0; FXSAVE_SIZE]));
        assert_eq!(er.data_size(), FXSAVE_SIZE);

        assert!(!er.set_to_raw_data(SupportedArch::X64, Format::XSave, vec![0; FXSAVE_SIZE]));
        assert!(er.set_to_raw_data(
            SupportedArch::X64,
            Format::XSave,
            vec![0; FXSAVE_SIZE + XSAVE_HEADER_SIZE + 256]
        ));

        assert!(!er.set_to_raw_data(SupportedArch::X64, Format::None, vec![0; 1]));
        assert!(er.set_to_raw_data(SupportedArch::X64, Format::None, vec![]));
        assert!(er.is_empty());
    }
}
