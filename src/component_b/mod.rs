// Component B: actuation
// Torque tables and the clipped update, the capabilities a vehicle backend
// provides, and the flash worker that commits tables to the controller.
pub mod torque_table;
pub mod capability;
pub mod flash;
