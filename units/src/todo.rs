/// Units which are simply type aliases for `f64` rather than having an
/// implementation as a `uom` `Quantity`.
///
/// These are used in the per-hit inner loops, where positions are always
/// millimetres in the (time, strip) plane or in detector XYZ, and charges are
/// in ADC counts. The aliases keep some clues in the source as to what the
/// numbers represent.

pub type Lengthf64 = f64; // mm
pub type Chargef64 = f64; // ADC counts
