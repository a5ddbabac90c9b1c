pub mod federatedstatus;
pub mod propagatedversion;
