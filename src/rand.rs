use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;

thread_local! {
    static THREAD_LOCAL_SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

const UPLOAD_NAME_LEN: usize = 20;

/// Draws a fresh name for a stored upload: 20 uppercase letters plus the
/// extension. Collisions are not checked; the space is 26^20.
pub fn gen_upload_filename(ext: &str) -> String {
    THREAD_LOCAL_SMALL_RNG.with(|cell| {
        let mut rng = cell.borrow_mut();
        let mut name = String::with_capacity(UPLOAD_NAME_LEN + ext.len());
        for _ in 0..UPLOAD_NAME_LEN {
            name.push(char::from(b'A' + rng.gen_range(0..26)));
        }
        name.push_str(ext);
        name
    })
}
