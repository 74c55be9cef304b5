/// Native top-level window handle (`HWND` on Windows).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WindowId {
    handle: isize,
}

impl WindowId {
    pub const fn from_raw_handle(raw_handle: isize) -> Self {
        Self { handle: raw_handle }
    }

    pub const fn raw_handle(&self) -> isize {
        self.handle
    }

    pub const fn is_null(&self) -> bool {
        self.handle == 0
    }

    pub fn stable_id(&self) -> String {
        format!("{:016x}", self.handle as usize as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_detected() {
        assert!(WindowId::from_raw_handle(0).is_null());
        assert!(!WindowId::from_raw_handle(0x1_0042).is_null());
    }

    #[test]
    fn stable_id_is_zero_padded_hex() {
        assert_eq!(
            WindowId::from_raw_handle(0x1_0042).stable_id(),
            "0000000000010042"
        );
    }
}
