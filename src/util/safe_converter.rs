
/// For widening casts that can not fail on supported platforms
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prechecked_cast_in_range() {
        let v: u16 = 65535usize.prechecked_cast();
        assert_eq!(v, u16::MAX);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let _: u16 = 65536usize.prechecked_cast();
    }
}
