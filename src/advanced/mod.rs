// Simulated hardware: stands in for the CAN/XCP stack on a bench without a vehicle.
pub mod simulated;
