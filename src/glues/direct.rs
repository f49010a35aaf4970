//! Direct glue: identity copy from the source layer into the destination slice.

/// `dst += src`.
pub fn forward(src_ac: &[f32], dst: &mut [f32]) {
    assert_eq!(src_ac.len(), dst.len(), "direct glue width mismatch");
    for (d, &s) in dst.iter_mut().zip(src_ac) {
        *d += s;
    }
}

/// `src_er += delta`.
pub fn backward(delta: &[f32], src_er: &mut [f32]) {
    assert_eq!(delta.len(), src_er.len(), "direct glue width mismatch");
    for (e, &d) in src_er.iter_mut().zip(delta) {
        *e += d;
    }
}
