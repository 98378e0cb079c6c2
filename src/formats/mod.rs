//! Module file format loaders. Only the ProTracker-family `.mod` loader
//! exists today (spec §1's Non-goals rule out other tracker formats).

pub mod modfile;
