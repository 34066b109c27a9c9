//! Physical quantity newtypes shared across module boundaries
//!
//! These are thin wrappers over `f64`. Measurement data in this domain is
//! inherently approximate (sense amplifiers, 16 bit converters), so no
//! lossless decimal representation is attempted. The newtypes exist so that a
//! millivolt never silently flows into a microamp slot.

use std::{
    fmt,
    ops::{ Add, Neg, Sub },
};

macro_rules! unit
{
    ($unit:ident, $suffix:literal, $precision:literal) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
        pub struct $unit(pub f64);

        impl $unit
        {
            pub fn value(self) -> f64
            {
                self.0
            }
        }

        impl From<f64> for $unit
        {
            fn from(value: f64) -> Self
            {
                Self(value)
            }
        }

        impl Add for $unit
        {
            type Output = Self;

            fn add(self, rhs: Self) -> Self
            {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $unit
        {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self
            {
                Self(self.0 - rhs.0)
            }
        }

        impl Neg for $unit
        {
            type Output = Self;

            fn neg(self) -> Self
            {
                Self(-self.0)
            }
        }

        impl fmt::Display for $unit
        {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
            {
                write!(f, concat!("{:.", $precision, "} ", $suffix), self.0)
            }
        }
    }
}

unit!(Millivolt, "mV", 3);
unit!(Microamp, "uA", 2);
unit!(Volt, "V", 4);
unit!(Kelvin, "K", 2);

/// Detected power. Displayed in scientific notation since the IF power meters
/// in this system report on the order of nanowatts.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Watt(pub f64);

impl Watt
{
    pub fn value(self) -> f64
    {
        self.0
    }
}

impl From<f64> for Watt
{
    fn from(value: f64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for Watt
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:.3e} W", self.0)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn display_carries_suffix_and_precision()
    {
        assert_eq!(&format!("{}", Millivolt(10.25)), "10.250 mV");
        assert_eq!(&format!("{}", Microamp(-3.5)), "-3.50 uA");
        assert_eq!(&format!("{}", Kelvin(4.2)), "4.20 K");
    }

    #[test]
    fn arithmetic_stays_in_unit()
    {
        assert_eq!(Millivolt(2.0) + Millivolt(0.5), Millivolt(2.5));
        assert_eq!(Microamp(70.0) - Microamp(20.0), Microamp(50.0));
        assert_eq!(-Volt(1.5), Volt(-1.5));
    }
}
