use bytes::Bytes;

/// Types that have a beanstalkd wire encoding.
pub trait BeanstalkSerialisable {
    /// Encodes the value as it is sent over the wire, including the trailing
    /// CRLF and any payload.
    fn serialise_beanstalk(&self) -> Vec<u8>;

    /// As `serialise_beanstalk`, frozen for handing to a transport.
    fn to_frame(&self) -> Bytes {
        self.serialise_beanstalk().into()
    }
}
