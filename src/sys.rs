//! Platform page size, queried once.
#[cfg(unix)]
fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page size: sysconf returned {}", ret);
    }

    ret as usize
}

#[cfg(not(unix))]
fn page_size_or_die() -> usize {
    4096
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the platform page size.  Arena alignments must be at least
/// this and a power of two.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 512);
    }
}
